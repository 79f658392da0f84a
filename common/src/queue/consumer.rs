// Job command consumer for NATS JetStream
//
// Each message carries one JSON `JobCommand`. Commands that can never
// succeed are terminated; transient failures are negatively acknowledged
// for redelivery. Only the lease owner pulls from the stream.

use crate::errors::{JobServiceError, QueueError};
use crate::models::{JobDetails, Recipient, TimeoutUnit};
use crate::queue::nats::NatsClient;
use crate::scheduler::TimerJobScheduler;
use crate::trigger::Trigger;
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::{AckKind, Message};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, instrument, warn};

/// Job submitted through the command feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewJob {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub trigger: Trigger,
    pub recipient: Recipient,
    /// Retry budget; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<u64>,
    #[serde(default)]
    pub execution_timeout_unit: TimeoutUnit,
}

impl NewJob {
    pub fn into_job(self, default_retries: u32) -> JobDetails {
        let mut job = JobDetails::new(self.id, self.trigger, self.recipient)
            .with_retries(self.retries.unwrap_or(default_retries))
            .with_priority(self.priority);
        job.correlation_id = self.correlation_id;
        if let Some(timeout) = self.execution_timeout {
            job = job.with_execution_timeout(timeout, self.execution_timeout_unit);
        }
        job
    }
}

/// Commands accepted on the feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum JobCommand {
    Create { job: NewJob },
    Cancel { id: String },
    Reschedule { id: String, trigger: Trigger },
}

/// How a processed message is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDisposition {
    /// Applied
    Ack,
    /// Transient failure, deliver again
    Nak,
    /// Can never be applied, drop it
    Term,
}

impl From<&Result<JobDetails, JobServiceError>> for CommandDisposition {
    fn from(result: &Result<JobDetails, JobServiceError>) -> Self {
        match result {
            Ok(_) => CommandDisposition::Ack,
            Err(e) if e.is_rejection() => CommandDisposition::Term,
            Err(_) => CommandDisposition::Nak,
        }
    }
}

/// Applies decoded commands to the scheduler
pub struct CommandHandler {
    scheduler: Arc<TimerJobScheduler>,
    default_retries: u32,
    ownership: Option<watch::Receiver<bool>>,
}

impl CommandHandler {
    pub fn new(scheduler: Arc<TimerJobScheduler>, default_retries: u32) -> Self {
        Self {
            scheduler,
            default_retries,
            ownership: None,
        }
    }

    /// Hand commands back for redelivery while `ownership` reads `false`
    pub fn with_ownership(mut self, ownership: watch::Receiver<bool>) -> Self {
        self.ownership = Some(ownership);
        self
    }

    pub fn is_owner(&self) -> bool {
        self.ownership
            .as_ref()
            .map_or(true, |ownership| *ownership.borrow())
    }

    pub async fn apply(&self, command: JobCommand) -> Result<JobDetails, JobServiceError> {
        match command {
            JobCommand::Create { job } => {
                self.scheduler
                    .schedule(job.into_job(self.default_retries))
                    .await
            }
            JobCommand::Cancel { id } => self.scheduler.cancel(&id).await,
            JobCommand::Reschedule { id, trigger } => {
                self.scheduler.reschedule(&id, trigger).await
            }
        }
    }

    /// Decode and apply one message payload
    pub async fn handle(&self, payload: &[u8]) -> CommandDisposition {
        if !self.is_owner() {
            debug!("Not the lease owner, leaving command to the owner");
            return CommandDisposition::Nak;
        }

        let command: JobCommand = match serde_json::from_slice(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable job command");
                return CommandDisposition::Term;
            }
        };

        let result = self.apply(command).await;
        match &result {
            Ok(job) => debug!(job_id = %job.id, status = %job.status, "Job command applied"),
            Err(e) => warn!(error = %e, "Job command failed"),
        }
        CommandDisposition::from(&result)
    }
}

/// Consumer of the command stream
#[async_trait::async_trait]
pub trait CommandConsumer: Send + Sync {
    /// Consume commands until shutdown is requested
    async fn start(&self) -> Result<(), QueueError>;

    /// Request graceful shutdown
    fn shutdown(&self);
}

/// NATS-based command consumer
pub struct NatsCommandConsumer {
    consumer: PullConsumer,
    handler: CommandHandler,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl NatsCommandConsumer {
    #[instrument(skip(client, handler))]
    pub async fn new(client: &NatsClient, handler: CommandHandler) -> Result<Self, QueueError> {
        info!("Creating NATS command consumer");
        let consumer = client.get_or_create_consumer().await?;

        Ok(Self {
            consumer,
            handler,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        })
    }

    #[instrument(skip(self, message), fields(
        message_id = ?message.info().map(|i| i.stream_sequence).ok(),
    ))]
    async fn process_message(&self, message: Message) -> Result<(), QueueError> {
        let disposition = self.handler.handle(&message.payload).await;

        let ack = match disposition {
            CommandDisposition::Ack => AckKind::Ack,
            CommandDisposition::Nak => AckKind::Nak(None),
            CommandDisposition::Term => AckKind::Term,
        };

        message.ack_with(ack).await.map_err(|e| {
            QueueError::AckFailed(format!("Failed to acknowledge message: {}", e))
        })?;

        debug!(?disposition, "Message acknowledged");
        Ok(())
    }
}

#[async_trait::async_trait]
impl CommandConsumer for NatsCommandConsumer {
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), QueueError> {
        info!("Starting command consumer");
        let mut ownership = self.handler.ownership.clone();

        'consume: loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                info!("Shutdown requested, stopping consumer");
                break;
            }

            if !self.handler.is_owner() {
                debug!("Not the lease owner, command consumption paused");
                tokio::select! {
                    _ = ownership_changed(&mut ownership) => continue 'consume,
                    _ = self.shutdown_notify.notified() => {
                        info!("Shutdown notification received");
                        break;
                    }
                }
            }

            let mut messages = self.consumer.messages().await.map_err(|e| {
                QueueError::ConsumeFailed(format!("Failed to create message stream: {}", e))
            })?;
            info!("Consuming commands");

            loop {
                if self.shutdown_flag.load(Ordering::Relaxed) {
                    info!("Shutdown requested, stopping consumer");
                    break 'consume;
                }

                tokio::select! {
                    message_result = messages.next() => {
                        match message_result {
                            Some(Ok(message)) => {
                                if let Err(e) = self.process_message(message).await {
                                    error!(error = %e, "Failed to process message");
                                }
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "Error receiving message");
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                            None => {
                                warn!("Message stream ended unexpectedly");
                                break 'consume;
                            }
                        }
                    }
                    _ = ownership_changed(&mut ownership) => {
                        if !self.handler.is_owner() {
                            // dropping the stream stops pulling; unacked
                            // messages are redelivered to the next owner
                            info!("Lease lost, pausing command consumption");
                            continue 'consume;
                        }
                    }
                    _ = self.shutdown_notify.notified() => {
                        info!("Shutdown notification received");
                        break 'consume;
                    }
                }
            }
        }

        info!("Consumer stopped gracefully");
        Ok(())
    }

    fn shutdown(&self) {
        info!("Requesting consumer shutdown");
        self.shutdown_flag.store(true, Ordering::Relaxed);
        self.shutdown_notify.notify_waiters();
    }
}

/// Resolves on the next ownership change; never without an ownership feed
async fn ownership_changed(ownership: &mut Option<watch::Receiver<bool>>) {
    if let Some(receiver) = ownership {
        if receiver.changed().await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::db::repositories::InMemoryJobRepository;
    use crate::models::JobStatus;
    use crate::retry::FixedBackoff;
    use crate::scheduler::{TimerJobSchedulerConfig, TokioTimerBackend};
    use chrono::Utc;

    fn handler() -> (
        CommandHandler,
        tokio::sync::mpsc::UnboundedReceiver<crate::scheduler::FiredTimer>,
    ) {
        let (backend, fired_rx) = TokioTimerBackend::new();
        let scheduler = Arc::new(TimerJobScheduler::new(
            TimerJobSchedulerConfig::default(),
            Arc::new(InMemoryJobRepository::new()),
            Arc::new(backend),
            Arc::new(SystemClock),
            Arc::new(FixedBackoff::default()),
        ));
        (CommandHandler::new(scheduler, 3), fired_rx)
    }

    fn create_payload(id: &str, fire_in: chrono::Duration) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "command": "create",
            "job": {
                "id": id,
                "trigger": {"type": "point_in_time", "fire_at": Utc::now() + fire_in},
                "recipient": {"type": "http", "url": "http://localhost/cb"}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_command_json_shape() {
        let json = serde_json::json!({"command": "cancel", "id": "job-1"});
        let command: JobCommand = serde_json::from_value(json).unwrap();
        assert_eq!(
            command,
            JobCommand::Cancel {
                id: "job-1".to_string()
            }
        );
    }

    #[test]
    fn test_new_job_uses_default_retries() {
        let new_job = NewJob {
            id: "a".to_string(),
            correlation_id: Some("c".to_string()),
            trigger: Trigger::point_in_time(Utc::now()),
            recipient: Recipient::Sink {
                subject: "s".to_string(),
                payload: None,
            },
            retries: None,
            priority: 4,
            execution_timeout: Some(5),
            execution_timeout_unit: TimeoutUnit::Seconds,
        };
        let job = new_job.clone().into_job(3);
        assert_eq!(job.retries, 3);
        assert_eq!(job.priority, 4);
        assert_eq!(job.correlation_id.as_deref(), Some("c"));
        assert_eq!(job.status, JobStatus::Scheduled);

        let job = NewJob {
            retries: Some(0),
            ..new_job
        }
        .into_job(3);
        assert_eq!(job.retries, 0);
    }

    #[tokio::test]
    async fn test_create_then_cancel() {
        let (handler, _fired_rx) = handler();

        let created = handler
            .handle(&create_payload("a", chrono::Duration::minutes(1)))
            .await;
        assert_eq!(created, CommandDisposition::Ack);
        assert!(handler.scheduler.scheduled("a").is_some());

        let cancel = serde_json::to_vec(&JobCommand::Cancel { id: "a".to_string() }).unwrap();
        assert_eq!(handler.handle(&cancel).await, CommandDisposition::Ack);
        assert!(handler.scheduler.get("a").await.unwrap().is_none());

        // canceling again can never succeed
        assert_eq!(handler.handle(&cancel).await, CommandDisposition::Term);
    }

    #[tokio::test]
    async fn test_rejections_and_garbage_are_terminated() {
        let (handler, _fired_rx) = handler();

        let expired = handler
            .handle(&create_payload("late", -chrono::Duration::minutes(1)))
            .await;
        assert_eq!(expired, CommandDisposition::Term);

        assert_eq!(handler.handle(b"not json").await, CommandDisposition::Term);
    }

    #[tokio::test]
    async fn test_reschedule_command() {
        let (handler, _fired_rx) = handler();
        handler
            .handle(&create_payload("a", chrono::Duration::minutes(1)))
            .await;

        let new_fire = Utc::now() + chrono::Duration::minutes(5);
        let job = handler
            .apply(JobCommand::Reschedule {
                id: "a".to_string(),
                trigger: Trigger::point_in_time(new_fire),
            })
            .await
            .unwrap();
        assert_eq!(job.fire_time(), Some(new_fire));
        assert_eq!(job.retries, 3);
    }

    #[tokio::test]
    async fn test_commands_wait_for_the_lease_owner() {
        let (handler, _fired_rx) = handler();
        let (owner_tx, owner_rx) = watch::channel(false);
        let handler = handler.with_ownership(owner_rx);

        let payload = create_payload("a", chrono::Duration::minutes(1));
        assert_eq!(handler.handle(&payload).await, CommandDisposition::Nak);
        assert!(handler.scheduler.get("a").await.unwrap().is_none());

        owner_tx.send(true).unwrap();
        assert_eq!(handler.handle(&payload).await, CommandDisposition::Ack);
        assert!(handler.scheduler.scheduled("a").is_some());
    }

    #[tokio::test]
    async fn test_ownership_change_wakes_a_paused_consumer() {
        let (owner_tx, owner_rx) = watch::channel(false);
        let mut ownership = Some(owner_rx);

        let waiting = tokio::spawn(async move {
            ownership_changed(&mut ownership).await;
            ownership.map(|receiver| *receiver.borrow())
        });
        owner_tx.send(true).unwrap();
        assert_eq!(waiting.await.unwrap(), Some(true));

        // untracked ownership never wakes anyone
        let mut untracked = None;
        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            ownership_changed(&mut untracked),
        )
        .await;
        assert!(pending.is_err());
    }

    #[test]
    fn test_storage_errors_are_redelivered() {
        let result: Result<JobDetails, JobServiceError> = Err(JobServiceError::Storage(
            crate::errors::StorageError::ConnectionFailed("down".to_string()),
        ));
        assert_eq!(CommandDisposition::from(&result), CommandDisposition::Nak);
    }
}
