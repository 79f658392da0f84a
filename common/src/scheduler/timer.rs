// In-process timer backend
//
// The scheduler only ever asks a backend to arm or disarm one timer per job
// id. Fired timers are reported on an mpsc channel consumed by the
// dispatcher.

use crate::errors::JobServiceError;
use crate::models::JobDetails;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// A timer that reached its deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTimer {
    pub job_id: String,
    pub handle: String,
}

/// TimerBackend arms and disarms in-process timers
#[cfg_attr(test, mockall::automock)]
pub trait TimerBackend: Send + Sync {
    /// Arm a timer firing after `delay`, returning its handle
    fn do_schedule(&self, job: &JobDetails, delay: Duration) -> Result<String, JobServiceError>;

    /// Disarm the timer of `job`; `false` if none was armed
    fn do_cancel(&self, job: &JobDetails) -> bool;
}

struct ArmedTask {
    handle: String,
    abort: AbortHandle,
}

/// Timer backend built on `tokio::time::sleep` tasks
pub struct TokioTimerBackend {
    tasks: Arc<Mutex<HashMap<String, ArmedTask>>>,
    fired_tx: mpsc::UnboundedSender<FiredTimer>,
}

impl TokioTimerBackend {
    /// Create a backend and the receiver its fired timers are sent to
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FiredTimer>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let backend = Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            fired_tx,
        };
        (backend, fired_rx)
    }

    /// Number of timers that have not fired yet
    pub fn armed_count(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl TimerBackend for TokioTimerBackend {
    fn do_schedule(&self, job: &JobDetails, delay: Duration) -> Result<String, JobServiceError> {
        if self.fired_tx.is_closed() {
            return Err(JobServiceError::Timer(
                "fired timer receiver dropped".to_string(),
            ));
        }

        let handle = Uuid::new_v4().to_string();
        let job_id = job.id.clone();
        let tasks = self.tasks.clone();
        let fired_tx = self.fired_tx.clone();
        let fired = FiredTimer {
            job_id: job_id.clone(),
            handle: handle.clone(),
        };

        let mut armed = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut tasks = tasks.lock().unwrap_or_else(|e| e.into_inner());
                if tasks.get(&fired.job_id).map(|t| t.handle.as_str()) == Some(fired.handle.as_str()) {
                    tasks.remove(&fired.job_id);
                }
            }

            if fired_tx.send(fired).is_err() {
                warn!("Timer fired after dispatcher shut down");
            }
        });

        if let Some(previous) = armed.insert(
            job_id.clone(),
            ArmedTask {
                handle: handle.clone(),
                abort: task.abort_handle(),
            },
        ) {
            previous.abort.abort();
        }

        debug!(job_id = %job_id, handle = %handle, delay_ms = delay.as_millis() as u64, "Timer armed");
        Ok(handle)
    }

    fn do_cancel(&self, job: &JobDetails) -> bool {
        let removed = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job.id);

        match removed {
            Some(task) => {
                task.abort.abort();
                debug!(job_id = %job.id, handle = %task.handle, "Timer disarmed");
                true
            }
            None => false,
        }
    }
}
