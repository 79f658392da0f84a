// Job dispatcher: turns fired timers into executions and feeds the
// outcome back into the scheduler

use crate::clock::Clock;
use crate::errors::JobServiceError;
use crate::executor::JobExecutor;
use crate::models::{ExecutionResponse, JobDetails};
use crate::scheduler::engine::TimerJobScheduler;
use crate::scheduler::timer::FiredTimer;
use crate::telemetry;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Status code reported when the recipient could not be reached
pub const UNREACHABLE_STATUS: u16 = 500;

pub struct JobDispatcher {
    scheduler: Arc<TimerJobScheduler>,
    executor: Arc<dyn JobExecutor>,
    clock: Arc<dyn Clock>,
}

impl JobDispatcher {
    pub fn new(
        scheduler: Arc<TimerJobScheduler>,
        executor: Arc<dyn JobExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            scheduler,
            executor,
            clock,
        }
    }

    /// Consume fired timers until the channel closes or shutdown is
    /// signalled, then wait for in-flight executions
    pub async fn run(
        self: Arc<Self>,
        mut fired_rx: mpsc::UnboundedReceiver<FiredTimer>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("Job dispatcher started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                fired = fired_rx.recv() => {
                    let Some(fired) = fired else {
                        warn!("Timer channel closed");
                        break;
                    };
                    let dispatcher = self.clone();
                    in_flight.spawn(async move {
                        if let Err(e) = dispatcher.dispatch(fired).await {
                            error!(error = %e, "Failed to dispatch fired job");
                        }
                    });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping dispatcher");
                    break;
                }
            }
        }

        while in_flight.join_next().await.is_some() {}
        info!("Job dispatcher stopped");
    }

    /// Execute one fired timer.
    ///
    /// Returns the job snapshot after its outcome was applied, or `None` for
    /// a stale fire.
    #[instrument(skip(self, fired), fields(job_id = %fired.job_id, handle = %fired.handle))]
    pub async fn dispatch(
        &self,
        fired: FiredTimer,
    ) -> Result<Option<JobDetails>, JobServiceError> {
        let Some(job) = self
            .scheduler
            .take_fired(&fired.job_id, &fired.handle)
            .await?
        else {
            debug!("Fired timer no longer current");
            return Ok(None);
        };

        let started = Instant::now();
        let response = match self.executor.execute(&job).await {
            Ok(response) => response,
            Err(e) => ExecutionResponse::new(
                job.id.clone(),
                UNREACHABLE_STATUS,
                e.to_string(),
                self.clock.now(),
            ),
        };

        telemetry::record_execution_duration(
            job.recipient.kind(),
            response.is_success(),
            started.elapsed(),
        );

        let outcome = if response.is_success() {
            self.scheduler.handle_job_execution_success(&job.id).await
        } else {
            self.scheduler.handle_job_execution_error(response).await
        };

        match outcome {
            Ok(job) => Ok(Some(job)),
            // canceled while executing
            Err(JobServiceError::JobNotFound(_)) => {
                debug!("Job removed during execution");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::db::repositories::InMemoryJobRepository;
    use crate::errors::ExecutionError;
    use crate::models::{JobStatus, Recipient};
    use crate::retry::FixedBackoff;
    use crate::scheduler::engine::TimerJobSchedulerConfig;
    use crate::scheduler::timer::TokioTimerBackend;
    use crate::trigger::Trigger;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingExecutor {
        calls: AtomicUsize,
        status_code: u16,
    }

    #[async_trait]
    impl JobExecutor for CountingExecutor {
        async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutionResponse::new(
                job.id.clone(),
                self.status_code,
                "counted",
                Utc::now(),
            ))
        }
    }

    struct Setup {
        scheduler: Arc<TimerJobScheduler>,
        executor: Arc<CountingExecutor>,
        shutdown_tx: broadcast::Sender<()>,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(status_code: u16) -> Setup {
        let clock = Arc::new(SystemClock);
        let (backend, fired_rx) = TokioTimerBackend::new();
        let scheduler = Arc::new(TimerJobScheduler::new(
            TimerJobSchedulerConfig::default(),
            Arc::new(InMemoryJobRepository::new()),
            Arc::new(backend),
            clock.clone(),
            Arc::new(FixedBackoff::new(Duration::from_millis(20))),
        ));
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
            status_code,
        });
        let dispatcher = Arc::new(JobDispatcher::new(
            scheduler.clone(),
            executor.clone(),
            clock,
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(dispatcher.run(fired_rx, shutdown_rx));

        Setup {
            scheduler,
            executor,
            shutdown_tx,
            handle,
        }
    }

    fn sink_job(id: &str, trigger: Trigger) -> JobDetails {
        JobDetails::new(
            id,
            trigger,
            Recipient::Sink {
                subject: "jobs.fired".to_string(),
                payload: None,
            },
        )
    }

    #[tokio::test]
    async fn test_periodic_job_fires_each_occurrence_once() {
        let setup = start(200);
        let job = sink_job(
            "tick",
            Trigger::interval(
                Utc::now() + chrono::Duration::milliseconds(20),
                chrono::Duration::milliseconds(20),
                Some(3),
            ),
        );
        setup.scheduler.schedule(job).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(setup.executor.calls.load(Ordering::SeqCst), 3);
        assert!(setup.scheduler.get("tick").await.unwrap().is_none());

        setup.shutdown_tx.send(()).unwrap();
        setup.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_job_retries_then_errors() {
        let setup = start(500);
        let job = sink_job(
            "flaky",
            Trigger::point_in_time(Utc::now() + chrono::Duration::milliseconds(10)),
        )
        .with_retries(2);
        setup.scheduler.schedule(job).await.unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        // first attempt plus two retries
        assert_eq!(setup.executor.calls.load(Ordering::SeqCst), 3);
        let stored = setup.scheduler.get("flaky").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);

        setup.shutdown_tx.send(()).unwrap();
        setup.handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_fire_is_ignored() {
        let setup = start(200);
        let job = sink_job(
            "a",
            Trigger::point_in_time(Utc::now() + chrono::Duration::minutes(1)),
        );
        setup.scheduler.schedule(job).await.unwrap();

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dispatcher = JobDispatcher::new(setup.scheduler.clone(), setup.executor.clone(), clock);
        let outcome = dispatcher
            .dispatch(FiredTimer {
                job_id: "a".to_string(),
                handle: "not-the-armed-timer".to_string(),
            })
            .await
            .unwrap();

        assert!(outcome.is_none());
        assert_eq!(setup.executor.calls.load(Ordering::SeqCst), 0);
        assert!(setup.scheduler.scheduled("a").is_some());

        setup.shutdown_tx.send(()).unwrap();
        setup.handle.await.unwrap();
    }
}
