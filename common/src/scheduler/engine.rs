// Timer job scheduler: the job state machine
//
// Every transition persists a new JobDetails snapshot and keeps the
// in-process armed map in step with the timer backend. The store is the
// source of truth; the armed map only mirrors timers of this process.

use crate::clock::Clock;
use crate::config::JobsConfig;
use crate::db::repositories::JobRepository;
use crate::errors::JobServiceError;
use crate::models::{ExecutionResponse, JobDetails, JobDetailsPatch, JobStatus};
use crate::retry::RetryPolicy;
use crate::scheduler::locks::JobLocks;
use crate::scheduler::timer::TimerBackend;
use crate::telemetry;
use crate::trigger::Trigger;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct TimerJobSchedulerConfig {
    /// Jobs firing within this horizon get a live timer
    pub chunk_window: Duration,
    /// Accept and immediately arm jobs whose fire time already passed
    pub force_execute_expired_jobs: bool,
}

impl Default for TimerJobSchedulerConfig {
    fn default() -> Self {
        Self {
            chunk_window: Duration::minutes(10),
            force_execute_expired_jobs: false,
        }
    }
}

impl From<&JobsConfig> for TimerJobSchedulerConfig {
    fn from(config: &JobsConfig) -> Self {
        Self {
            chunk_window: config.chunk_window(),
            force_execute_expired_jobs: config.force_execute_expired_jobs,
        }
    }
}

#[derive(Debug, Clone)]
struct ArmedTimer {
    handle: String,
    fire_at: DateTime<Utc>,
}

/// TimerJobScheduler owns job transitions and the timers of this process
pub struct TimerJobScheduler {
    config: TimerJobSchedulerConfig,
    repository: Arc<dyn JobRepository>,
    backend: Arc<dyn TimerBackend>,
    clock: Arc<dyn Clock>,
    retry_policy: Arc<dyn RetryPolicy>,
    locks: JobLocks,
    armed: Mutex<HashMap<String, ArmedTimer>>,
    ownership: Option<watch::Receiver<bool>>,
}

impl TimerJobScheduler {
    pub fn new(
        config: TimerJobSchedulerConfig,
        repository: Arc<dyn JobRepository>,
        backend: Arc<dyn TimerBackend>,
        clock: Arc<dyn Clock>,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            config,
            repository,
            backend,
            clock,
            retry_policy,
            locks: JobLocks::new(),
            armed: Mutex::new(HashMap::new()),
            ownership: None,
        }
    }

    /// Only arm timers while `ownership` reads `true`.
    ///
    /// Without it every transition may arm. Jobs stored while not owning
    /// stay unarmed until the owner's reconciler picks them up.
    pub fn with_ownership(mut self, ownership: watch::Receiver<bool>) -> Self {
        self.ownership = Some(ownership);
        self
    }

    fn may_arm(&self) -> bool {
        self.ownership
            .as_ref()
            .map_or(true, |ownership| *ownership.borrow())
    }

    pub fn config(&self) -> &TimerJobSchedulerConfig {
        &self.config
    }

    /// Persist `job` and arm it if it fires within the chunk window.
    ///
    /// A stored job with the same id is replaced in place, timer included;
    /// its creation time is kept.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn schedule(&self, job: JobDetails) -> Result<JobDetails, JobServiceError> {
        self.validate_fire_time(&job.id, &job.trigger)?;

        let _guard = self.locks.lock(&job.id).await;
        let scheduled = self.schedule_locked(job).await?;

        telemetry::record_job_scheduled();
        info!(
            status = %scheduled.status,
            fire_time = ?scheduled.fire_time(),
            armed = scheduled.scheduled_id.is_some(),
            "Job scheduled"
        );
        Ok(scheduled)
    }

    /// Disarm and delete a job
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> Result<JobDetails, JobServiceError> {
        let _guard = self.locks.lock(id).await;

        let job = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| JobServiceError::JobNotFound(id.to_string()))?;

        self.disarm(&job);
        self.repository.delete(id).await?;

        telemetry::record_job_canceled();
        info!("Job canceled");
        Ok(job.with_status(JobStatus::Canceled).with_scheduled_id(None))
    }

    /// Consume the fired occurrence; periodic jobs are re-armed, exhausted
    /// jobs are deleted
    #[instrument(skip(self))]
    pub async fn handle_job_execution_success(
        &self,
        id: &str,
    ) -> Result<JobDetails, JobServiceError> {
        let _guard = self.locks.lock(id).await;

        let job = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| JobServiceError::JobNotFound(id.to_string()))?;

        self.disarm(&job);
        let execution_counter = job.execution_counter + 1;
        telemetry::record_job_executed();

        match job.trigger.advance() {
            None => {
                self.repository.delete(id).await?;
                info!(execution_counter, "Job executed, no further occurrences");
                Ok(job
                    .with_status(JobStatus::Executed)
                    .with_execution_counter(execution_counter)
                    .with_scheduled_id(None))
            }
            Some(next) => {
                let next_job = job
                    .with_trigger(next)
                    .with_status(JobStatus::Scheduled)
                    .with_execution_counter(execution_counter)
                    .with_scheduled_id(None);
                let saved = self.repository.save(&next_job).await?;
                let armed = self.arm_if_in_window(saved).await?;
                info!(
                    execution_counter,
                    next_fire_time = ?armed.fire_time(),
                    "Job executed, next occurrence scheduled"
                );
                Ok(armed)
            }
        }
    }

    /// Retry the failed occurrence while budget remains, otherwise mark the
    /// job as failed
    #[instrument(skip(self, response), fields(job_id = %response.job_id, status_code = response.status_code))]
    pub async fn handle_job_execution_error(
        &self,
        response: ExecutionResponse,
    ) -> Result<JobDetails, JobServiceError> {
        let id = response.job_id.as_str();
        let _guard = self.locks.lock(id).await;

        let job = self
            .repository
            .get(id)
            .await?
            .ok_or_else(|| JobServiceError::JobNotFound(id.to_string()))?;

        if job.status == JobStatus::Error {
            debug!("Job already failed, ignoring error report");
            return Ok(job);
        }

        self.disarm(&job);
        telemetry::record_job_execution_error();

        if job.retries > 0 {
            let attempt = job.trigger.retry_attempt() + 1;
            let delay = self.retry_policy.retry_delay(attempt);
            let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
            let retry_at = self.clock.now() + delay;

            let retries = job.retries - 1;
            let retry_trigger = job.trigger.retry(retry_at);
            let retry_job = job
                .with_retries(retries)
                .with_status(JobStatus::Retry)
                .with_trigger(retry_trigger)
                .with_scheduled_id(None);

            let saved = self.repository.save(&retry_job).await?;
            let armed = self.arm_if_in_window(saved).await?;
            warn!(
                attempt,
                retries_left = retries,
                retry_at = %retry_at,
                message = %response.message,
                "Job execution failed, retry scheduled"
            );
            Ok(armed)
        } else {
            let failed = job.with_status(JobStatus::Error).with_scheduled_id(None);
            let saved = self.repository.save(&failed).await?;
            warn!(message = %response.message, "Job execution failed, retries exhausted");
            Ok(saved)
        }
    }

    /// Replace the trigger of a stored job and re-arm it.
    ///
    /// The old timer is torn down before the new one is created.
    #[instrument(skip(self, trigger))]
    pub async fn reschedule(
        &self,
        id: &str,
        trigger: Trigger,
    ) -> Result<JobDetails, JobServiceError> {
        self.validate_fire_time(id, &trigger)?;

        let _guard = self.locks.lock(id).await;

        let merged = self
            .repository
            .merge(id, &JobDetailsPatch::trigger(trigger))
            .await?
            .ok_or_else(|| JobServiceError::JobNotFound(id.to_string()))?;

        self.disarm(&merged);
        let rescheduled = self
            .schedule_locked(merged.with_status(JobStatus::Scheduled))
            .await?;

        info!(fire_time = ?rescheduled.fire_time(), "Job rescheduled");
        Ok(rescheduled)
    }

    /// Fire time of the timer armed for `id` in this process
    pub fn scheduled(&self, id: &str) -> Option<DateTime<Utc>> {
        self.armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|armed| armed.fire_at)
    }

    /// Number of timers armed in this process
    pub fn armed_count(&self) -> usize {
        self.armed.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Arm the stored job `id` unless something already took care of it.
    ///
    /// The row is re-read under the job lock, so a cancel or reschedule
    /// committed after the caller saw the job wins. Returns the armed
    /// snapshot, or `None` when the job is gone, inactive, outside the
    /// window or already armed here.
    #[instrument(skip(self))]
    pub async fn arm_if_unarmed(&self, id: &str) -> Result<Option<JobDetails>, JobServiceError> {
        let _guard = self.locks.lock(id).await;

        if self.scheduled(id).is_some() {
            return Ok(None);
        }

        let Some(job) = self.repository.get(id).await? else {
            debug!("Job gone before it could be armed");
            return Ok(None);
        };
        if !job.status.is_active() {
            debug!(status = %job.status, "Job no longer active");
            return Ok(None);
        }

        let armed = self.arm_if_in_window(job).await?;
        Ok(armed.scheduled_id.is_some().then_some(armed))
    }

    /// Drop every timer of this process, leaving the stored jobs as they
    /// are for the next lease owner
    #[instrument(skip(self))]
    pub async fn disarm_all(&self) -> usize {
        let ids: Vec<String> = self
            .armed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();

        let mut disarmed = 0;
        for id in ids {
            let _guard = self.locks.lock(&id).await;
            if !self.forget(&id) {
                continue;
            }
            disarmed += 1;
            // a fire of an unknown timer is dropped by take_fired anyway
            match self.repository.get(&id).await {
                Ok(Some(job)) => {
                    self.backend.do_cancel(&job);
                }
                Ok(None) => {}
                Err(e) => warn!(job_id = %id, error = %e, "Could not load job to cancel its timer"),
            }
        }

        if disarmed > 0 {
            info!(disarmed, "Disarmed all local timers");
        }
        disarmed
    }

    /// Stored snapshot of a job
    pub async fn get(&self, id: &str) -> Result<Option<JobDetails>, JobServiceError> {
        Ok(self.repository.get(id).await?)
    }

    /// Claim a fired timer.
    ///
    /// Returns the job only if `handle` is still the armed timer of `id`;
    /// fires of replaced or canceled timers yield `None`.
    #[instrument(skip(self))]
    pub async fn take_fired(
        &self,
        id: &str,
        handle: &str,
    ) -> Result<Option<JobDetails>, JobServiceError> {
        let _guard = self.locks.lock(id).await;

        {
            let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
            match armed.get(id) {
                Some(current) if current.handle == handle => {
                    armed.remove(id);
                    telemetry::set_armed_timers(armed.len());
                }
                _ => {
                    debug!("Stale timer fire dropped");
                    return Ok(None);
                }
            }
        }

        Ok(self.repository.get(id).await?)
    }

    fn validate_fire_time(&self, id: &str, trigger: &Trigger) -> Result<(), JobServiceError> {
        if let Some(reason) = trigger.defect() {
            return Err(JobServiceError::InvalidTrigger {
                job_id: id.to_string(),
                reason,
            });
        }

        let now = self.clock.now();
        let fire_time = trigger.next_fire_time();

        match fire_time {
            Some(at) if at >= now || self.config.force_execute_expired_jobs => Ok(()),
            _ => Err(JobServiceError::InvalidScheduleTime {
                job_id: id.to_string(),
                fire_time,
                now,
            }),
        }
    }

    async fn schedule_locked(&self, job: JobDetails) -> Result<JobDetails, JobServiceError> {
        if let Some(existing) = self.repository.get(&job.id).await? {
            self.disarm(&existing);
            debug!("Replacing stored job with the same id");
        }

        let status = match job.status {
            JobStatus::Retry => JobStatus::Retry,
            _ => JobStatus::Scheduled,
        };
        let stored = self
            .repository
            .save(&job.with_status(status).with_scheduled_id(None))
            .await?;

        self.arm_if_in_window(stored).await
    }

    /// Arm `job` when it fires before the end of the current window.
    ///
    /// Overdue occurrences fire immediately.
    async fn arm_if_in_window(&self, job: JobDetails) -> Result<JobDetails, JobServiceError> {
        let Some(fire_at) = job.fire_time() else {
            return Ok(job);
        };

        let now = self.clock.now();
        if fire_at >= now + self.config.chunk_window {
            debug!(fire_time = %fire_at, "Job outside chunk window, left for reconciliation");
            return Ok(job);
        }
        if !self.may_arm() {
            debug!(fire_time = %fire_at, "Not the lease owner, job left for the owner to arm");
            return Ok(job);
        }

        let delay = (fire_at - now).to_std().unwrap_or(std::time::Duration::ZERO);
        let handle = self.backend.do_schedule(&job, delay)?;

        {
            let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
            armed.insert(
                job.id.clone(),
                ArmedTimer {
                    handle: handle.clone(),
                    fire_at,
                },
            );
            telemetry::set_armed_timers(armed.len());
        }

        match self
            .repository
            .save(&job.clone().with_scheduled_id(Some(handle)))
            .await
        {
            Ok(saved) => Ok(saved),
            Err(e) => {
                self.disarm(&job);
                Err(e.into())
            }
        }
    }

    fn forget(&self, id: &str) -> bool {
        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        let removed = armed.remove(id).is_some();
        if removed {
            telemetry::set_armed_timers(armed.len());
        }
        removed
    }

    fn disarm(&self, job: &JobDetails) -> bool {
        self.forget(&job.id);
        self.backend.do_cancel(job)
    }
}
