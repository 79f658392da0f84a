// Trigger value types
//
// A trigger answers "when does this job fire next" and "what remains after
// this occurrence is consumed". Triggers never read the wall clock; the
// scheduler compares their fire times against its own Clock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Unit of a `Trigger::Simple` period
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeriodUnit {
    Millis,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl PeriodUnit {
    /// Length of `amount` units, `None` when it does not fit a `Duration`
    pub fn duration(&self, amount: u64) -> Option<Duration> {
        let amount = i64::try_from(amount).ok()?;
        match self {
            PeriodUnit::Millis => Duration::try_milliseconds(amount),
            PeriodUnit::Seconds => Duration::try_seconds(amount),
            PeriodUnit::Minutes => Duration::try_minutes(amount),
            PeriodUnit::Hours => Duration::try_hours(amount),
            PeriodUnit::Days => Duration::try_days(amount),
        }
    }
}

/// Trigger defines when a job fires
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires once at `fire_at`
    PointInTime { fire_at: DateTime<Utc> },

    /// Fires at `fire_at`, then every `period_millis`.
    ///
    /// `repeat_limit` is the number of fires left including the current one;
    /// `None` repeats forever.
    Interval {
        fire_at: DateTime<Utc>,
        period_millis: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        repeat_limit: Option<u32>,
    },

    /// Fires at `start_at` and `repeat_count` more times, `period` units apart.
    ///
    /// `fired` counts the occurrences already consumed.
    Simple {
        start_at: DateTime<Utc>,
        period: u64,
        period_unit: PeriodUnit,
        repeat_count: u32,
        #[serde(default)]
        fired: u32,
    },

    /// Retry of a failed occurrence of `retried`.
    ///
    /// Consuming a retry consumes the occurrence it retries.
    Retry {
        fire_at: DateTime<Utc>,
        attempt: u32,
        retried: Box<Trigger>,
    },
}

impl Trigger {
    pub fn point_in_time(fire_at: DateTime<Utc>) -> Self {
        Trigger::PointInTime { fire_at }
    }

    pub fn interval(fire_at: DateTime<Utc>, period: Duration, repeat_limit: Option<u32>) -> Self {
        Trigger::Interval {
            fire_at,
            period_millis: period.num_milliseconds(),
            repeat_limit,
        }
    }

    pub fn simple(
        start_at: DateTime<Utc>,
        period: u64,
        period_unit: PeriodUnit,
        repeat_count: u32,
    ) -> Self {
        Trigger::Simple {
            start_at,
            period,
            period_unit,
            repeat_count,
            fired: 0,
        }
    }

    /// Fire time of the current occurrence, `None` once exhausted
    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Trigger::PointInTime { fire_at } => Some(*fire_at),
            Trigger::Interval {
                fire_at,
                repeat_limit,
                ..
            } => match repeat_limit {
                Some(0) => None,
                _ => Some(*fire_at),
            },
            Trigger::Simple {
                start_at,
                period,
                period_unit,
                repeat_count,
                fired,
            } => {
                if fired > repeat_count {
                    return None;
                }
                let offset = period_unit.duration(period.checked_mul(u64::from(*fired))?)?;
                start_at.checked_add_signed(offset)
            }
            Trigger::Retry { fire_at, .. } => Some(*fire_at),
        }
    }

    /// Trigger left after the current occurrence is consumed
    pub fn advance(&self) -> Option<Trigger> {
        match self {
            Trigger::PointInTime { .. } => None,
            Trigger::Interval {
                fire_at,
                period_millis,
                repeat_limit,
            } => {
                let remaining = match repeat_limit {
                    Some(n) if *n <= 1 => return None,
                    Some(n) => Some(n - 1),
                    None => None,
                };
                let period = Duration::try_milliseconds(*period_millis)?;
                Some(Trigger::Interval {
                    fire_at: fire_at.checked_add_signed(period)?,
                    period_millis: *period_millis,
                    repeat_limit: remaining,
                })
            }
            Trigger::Simple {
                start_at,
                period,
                period_unit,
                repeat_count,
                fired,
            } => {
                let fired = fired + 1;
                if fired > *repeat_count {
                    return None;
                }
                let next = Trigger::Simple {
                    start_at: *start_at,
                    period: *period,
                    period_unit: *period_unit,
                    repeat_count: *repeat_count,
                    fired,
                };
                // an occurrence past the representable range ends the trigger
                next.next_fire_time().map(|_| next)
            }
            Trigger::Retry { retried, .. } => retried.advance(),
        }
    }

    /// Why this trigger can never be scheduled, `None` if it can.
    ///
    /// Periods must move forward, and every occurrence of a bounded simple
    /// trigger must be representable.
    pub fn defect(&self) -> Option<&'static str> {
        match self {
            Trigger::PointInTime { .. } => None,
            Trigger::Interval { period_millis, .. } if *period_millis <= 0 => {
                Some("interval period must be positive")
            }
            Trigger::Interval { .. } => None,
            Trigger::Simple {
                period,
                repeat_count,
                ..
            } if *period == 0 && *repeat_count > 0 => Some("simple period must be positive"),
            Trigger::Simple {
                start_at,
                period,
                period_unit,
                repeat_count,
                ..
            } => {
                let last = period
                    .checked_mul(u64::from(*repeat_count))
                    .and_then(|amount| period_unit.duration(amount))
                    .and_then(|offset| start_at.checked_add_signed(offset));
                match last {
                    Some(_) => None,
                    None => Some("simple period out of range"),
                }
            }
            Trigger::Retry { retried, .. } => retried.defect(),
        }
    }

    /// Whether more than one occurrence is defined
    pub fn is_periodic(&self) -> bool {
        match self {
            Trigger::PointInTime { .. } => false,
            Trigger::Interval { repeat_limit, .. } => *repeat_limit != Some(1),
            Trigger::Simple { repeat_count, .. } => *repeat_count > 0,
            Trigger::Retry { retried, .. } => retried.is_periodic(),
        }
    }

    /// Retry the current occurrence at `fire_at`
    pub fn retry(&self, fire_at: DateTime<Utc>) -> Trigger {
        match self {
            Trigger::Retry {
                attempt, retried, ..
            } => Trigger::Retry {
                fire_at,
                attempt: attempt + 1,
                retried: retried.clone(),
            },
            other => Trigger::Retry {
                fire_at,
                attempt: 1,
                retried: Box::new(other.clone()),
            },
        }
    }

    /// Number of retries already attempted for the current occurrence
    pub fn retry_attempt(&self) -> u32 {
        match self {
            Trigger::Retry { attempt, .. } => *attempt,
            _ => 0,
        }
    }
}
