// Scheduler reconciler: windowed reload of due jobs from the store
//
// A pass arms every active job of the current chunk window that has no
// timer in this process. Passes run
// - every poll interval while the command feed is degraded,
// - every half chunk window as window rollover,
// - once whenever this instance becomes the lease owner.
// Passes are skipped while another instance owns the lease, and losing the
// lease drops every local timer.

use crate::clock::Clock;
use crate::config::JobsConfig;
use crate::db::repositories::JobRepository;
use crate::models::JobStatus;
use crate::scheduler::engine::TimerJobScheduler;
use crate::telemetry;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Connectivity state of the reactive command feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagingMode {
    /// Commands arrive reactively; no polling
    Healthy,
    /// Commands may be missed; poll the store
    Degraded,
}

/// Configuration for the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub chunk_window: chrono::Duration,
    pub poll_interval: Duration,
    /// Jobs scheduled concurrently within one pass
    pub concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            chunk_window: chrono::Duration::minutes(10),
            poll_interval: Duration::from_secs(60),
            concurrency: 16,
        }
    }
}

impl From<&JobsConfig> for ReconcilerConfig {
    fn from(config: &JobsConfig) -> Self {
        Self {
            chunk_window: config.chunk_window(),
            poll_interval: config.poll_interval(),
            concurrency: config.reconcile_concurrency,
        }
    }
}

impl ReconcilerConfig {
    fn rollover_period(&self) -> Duration {
        let window = self.chunk_window.to_std().unwrap_or(Duration::from_secs(60));
        (window / 2).max(Duration::from_secs(1))
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub skipped: bool,
    pub armed: usize,
    pub failed: usize,
}

pub struct SchedulerReconciler {
    scheduler: Arc<TimerJobScheduler>,
    repository: Arc<dyn JobRepository>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    ownership: watch::Receiver<bool>,
    mode: Mutex<Option<MessagingMode>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    rollover_task: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerReconciler {
    pub fn new(
        scheduler: Arc<TimerJobScheduler>,
        repository: Arc<dyn JobRepository>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
        ownership: watch::Receiver<bool>,
    ) -> Self {
        Self {
            scheduler,
            repository,
            clock,
            config,
            ownership,
            mode: Mutex::new(None),
            poll_task: Mutex::new(None),
            rollover_task: Mutex::new(None),
        }
    }

    /// Current messaging mode; `None` before the first transition
    pub fn mode(&self) -> Option<MessagingMode> {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a degraded-mode polling task is installed
    pub fn is_polling(&self) -> bool {
        self.poll_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Arm the active jobs of the current window that have no timer here
    #[instrument(skip(self))]
    pub async fn load_job_details(&self) -> ReconcileSummary {
        if !*self.ownership.borrow() {
            debug!("Not the lease owner, skipping reconciliation");
            return ReconcileSummary {
                skipped: true,
                ..Default::default()
            };
        }

        let from = self.clock.now();
        let to = from + self.config.chunk_window;
        let statuses = JobStatus::ACTIVE;
        let armed = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        self.repository
            .find_by_status_between_dates_order_by_priority(from, to, &statuses)
            .for_each_concurrent(self.config.concurrency, |item| {
                let armed = &armed;
                let failed = &failed;
                async move {
                    let job = match item {
                        Ok(job) => job,
                        Err(e) => {
                            error!(error = %e, "Failed to load job during reconciliation");
                            failed.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                    };

                    if self.scheduler.scheduled(&job.id).is_some() {
                        return;
                    }

                    match self.scheduler.arm_if_unarmed(&job.id).await {
                        Ok(Some(_)) => {
                            armed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(job_id = %job.id, error = %e, "Failed to re-arm job");
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;

        let summary = ReconcileSummary {
            skipped: false,
            armed: armed.into_inner(),
            failed: failed.into_inner(),
        };
        telemetry::record_reconcile_armed(summary.armed);
        if summary.armed > 0 || summary.failed > 0 {
            info!(armed = summary.armed, failed = summary.failed, "Reconciliation pass finished");
        } else {
            debug!("Reconciliation pass found nothing to arm");
        }
        summary
    }

    /// Switch between reactive and polling operation.
    ///
    /// The previous polling task is always aborted first.
    #[instrument(skip(self))]
    pub fn set_mode(self: &Arc<Self>, mode: MessagingMode) {
        let mut poll_task = self.poll_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = poll_task.take() {
            previous.abort();
        }
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = Some(mode);

        match mode {
            MessagingMode::Healthy => {
                info!("Command feed healthy, polling stopped");
            }
            MessagingMode::Degraded => {
                warn!(
                    poll_interval_seconds = self.config.poll_interval.as_secs(),
                    "Command feed degraded, polling the store"
                );
                let reconciler = self.clone();
                // first tick completes immediately
                *poll_task = Some(tokio::spawn(async move {
                    let mut ticker = interval(reconciler.config.poll_interval);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        reconciler.load_job_details().await;
                    }
                }));
            }
        }
    }

    /// Map a messaging connectivity change onto a mode transition
    pub fn on_messaging_status_change(self: &Arc<Self>, connected: bool) {
        let mode = if connected {
            MessagingMode::Healthy
        } else {
            MessagingMode::Degraded
        };
        self.set_mode(mode);
    }

    /// Start the window rollover task.
    ///
    /// Runs a pass right away, every half chunk window, and whenever this
    /// instance gains lease ownership.
    pub fn start(self: &Arc<Self>) {
        let mut rollover_task = self.rollover_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = rollover_task.take() {
            previous.abort();
        }

        let reconciler = self.clone();
        let mut ownership = self.ownership.clone();
        let period = self.config.rollover_period();
        info!(rollover_period_seconds = period.as_secs(), "Starting reconciler");

        *rollover_task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut watching = true;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        reconciler.load_job_details().await;
                    }
                    changed = ownership.changed(), if watching => {
                        if changed.is_err() {
                            debug!("Ownership channel closed");
                            watching = false;
                            continue;
                        }
                        let owner = *ownership.borrow_and_update();
                        if owner {
                            info!("Lease acquired, rebuilding armed timers");
                            reconciler.load_job_details().await;
                        } else {
                            reconciler.scheduler.disarm_all().await;
                        }
                    }
                }
            }
        }));
    }

    /// Abort every background task of the reconciler
    pub fn stop(&self) {
        for slot in [&self.poll_task, &self.rollover_task] {
            if let Some(task) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                task.abort();
            }
        }
        info!("Reconciler stopped");
    }
}
