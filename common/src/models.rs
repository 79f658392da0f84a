use crate::trigger::Trigger;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Job Models
// ============================================================================

/// JobStatus is the lifecycle state of a job record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Scheduled,
    Retry,
    Executed,
    Error,
    Canceled,
}

impl JobStatus {
    /// Statuses the reconciler picks up for arming
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Scheduled, JobStatus::Retry];

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Scheduled => "SCHEDULED",
            JobStatus::Retry => "RETRY",
            JobStatus::Executed => "EXECUTED",
            JobStatus::Error => "ERROR",
            JobStatus::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(JobStatus::Scheduled),
            "RETRY" => Ok(JobStatus::Retry),
            "EXECUTED" => Ok(JobStatus::Executed),
            "ERROR" => Ok(JobStatus::Error),
            "CANCELED" => Ok(JobStatus::Canceled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, <JobStatus as TryFrom<String>>::Error> {
        Self::from_str(&s)
    }
}

/// Unit of the advisory execution timeout
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutUnit {
    Millis,
    #[default]
    Seconds,
    Minutes,
}

impl TimeoutUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutUnit::Millis => "MILLIS",
            TimeoutUnit::Seconds => "SECONDS",
            TimeoutUnit::Minutes => "MINUTES",
        }
    }

    pub fn to_std(&self, amount: u64) -> std::time::Duration {
        match self {
            TimeoutUnit::Millis => std::time::Duration::from_millis(amount),
            TimeoutUnit::Seconds => std::time::Duration::from_secs(amount),
            TimeoutUnit::Minutes => std::time::Duration::from_secs(amount.saturating_mul(60)),
        }
    }
}

impl FromStr for TimeoutUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MILLIS" => Ok(TimeoutUnit::Millis),
            "SECONDS" => Ok(TimeoutUnit::Seconds),
            "MINUTES" => Ok(TimeoutUnit::Minutes),
            _ => Err(format!("Invalid timeout unit: {}", s)),
        }
    }
}

/// HttpMethod used by HTTP recipients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

/// Recipient is the executor target of a job.
///
/// The scheduler never looks inside; only executors interpret it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipient {
    Http {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    Sink {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
}

impl Recipient {
    /// Short label used in metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Recipient::Http { .. } => "http",
            Recipient::Sink { .. } => "sink",
        }
    }
}

/// JobDetails is the durable job record.
///
/// Transitions produce new snapshots through the `with_*` methods; the
/// scheduler persists each snapshot explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobDetails {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub status: JobStatus,
    pub trigger: Trigger,
    pub recipient: Recipient,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub execution_counter: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<u64>,
    #[serde(default)]
    pub execution_timeout_unit: TimeoutUnit,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl JobDetails {
    /// Create a new job in `Scheduled` status
    pub fn new(id: impl Into<String>, trigger: Trigger, recipient: Recipient) -> Self {
        Self {
            id: id.into(),
            correlation_id: None,
            status: JobStatus::Scheduled,
            trigger,
            recipient,
            retries: 0,
            execution_counter: 0,
            scheduled_id: None,
            priority: 0,
            execution_timeout: None,
            execution_timeout_unit: TimeoutUnit::default(),
            last_update: None,
            created: None,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_scheduled_id(mut self, scheduled_id: Option<String>) -> Self {
        self.scheduled_id = scheduled_id;
        self
    }

    pub fn with_execution_timeout(mut self, amount: u64, unit: TimeoutUnit) -> Self {
        self.execution_timeout = Some(amount);
        self.execution_timeout_unit = unit;
        self
    }

    pub fn with_execution_counter(mut self, execution_counter: u32) -> Self {
        self.execution_counter = execution_counter;
        self
    }

    /// Fire time of the current occurrence
    pub fn fire_time(&self) -> Option<DateTime<Utc>> {
        self.trigger.next_fire_time()
    }

    /// Advisory execution timeout
    pub fn execution_timeout_duration(&self) -> Option<std::time::Duration> {
        self.execution_timeout
            .map(|amount| self.execution_timeout_unit.to_std(amount))
    }
}

/// JobDetailsPatch holds the fields a store-level merge may overwrite
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobDetailsPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<Trigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Recipient>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<u64>,
}

impl JobDetailsPatch {
    pub fn trigger(trigger: Trigger) -> Self {
        Self {
            trigger: Some(trigger),
            ..Default::default()
        }
    }

    /// Apply the patch on top of `job`
    pub fn apply(&self, mut job: JobDetails) -> JobDetails {
        if let Some(trigger) = &self.trigger {
            job.trigger = trigger.clone();
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(recipient) = &self.recipient {
            job.recipient = recipient.clone();
        }
        if let Some(retries) = self.retries {
            job.retries = retries;
        }
        if let Some(timeout) = self.execution_timeout {
            job.execution_timeout = Some(timeout);
        }
        job
    }
}

// ============================================================================
// Execution Models
// ============================================================================

/// ExecutionResponse is what an executor reports back for one fire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResponse {
    pub job_id: String,
    pub message: String,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResponse {
    pub fn new(
        job_id: impl Into<String>,
        status_code: u16,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            message: message.into(),
            status_code,
            timestamp,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

// ============================================================================
// Lease Models
// ============================================================================

/// JobServiceManagementInfo is the lease row of one duty slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct JobServiceManagementInfo {
    pub id: String,
    pub token: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl JobServiceManagementInfo {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: Some(token.into()),
            last_heartbeat: None,
        }
    }

    /// Whether `token` currently holds the slot
    pub fn is_held_by(&self, token: &str) -> bool {
        self.token.as_deref() == Some(token)
    }
}
