// Error handling framework for the jobs service

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the scheduling state machine
#[derive(Error, Debug)]
pub enum JobServiceError {
    #[error("Invalid schedule time for job {job_id}: fire time {fire_time:?} is before {now}")]
    InvalidScheduleTime {
        job_id: String,
        fire_time: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    },

    #[error("Invalid trigger for job {job_id}: {reason}")]
    InvalidTrigger { job_id: String, reason: &'static str },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Timer backend failed: {0}")]
    Timer(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl JobServiceError {
    /// Whether the caller asked for something that can never succeed as-is
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            JobServiceError::InvalidScheduleTime { .. }
                | JobServiceError::InvalidTrigger { .. }
                | JobServiceError::JobNotFound(_)
        )
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid row for {entity}: {reason}")]
    InvalidRow { entity: String, reason: String },
}

/// Executor errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("HTTP request failed: {0}")]
    HttpRequestFailed(String),

    #[error("Publish to sink failed: {0}")]
    SinkPublishFailed(String),

    #[error("Execution timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Unsupported recipient: {0}")]
    UnsupportedRecipient(String),
}

/// Queue-related errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Failed to connect to queue: {0}")]
    Connection(String),

    #[error("Failed to create stream: {0}")]
    StreamCreation(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Failed to create consumer: {0}")]
    ConsumerCreation(String),

    #[error("Failed to consume message: {0}")]
    ConsumeFailed(String),

    #[error("Failed to acknowledge message: {0}")]
    AckFailed(String),

    #[error("Message deserialization failed: {0}")]
    DeserializationFailed(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => StorageError::DatabaseError(db_err.message().to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StorageError::ConnectionFailed(err.to_string())
            }
            _ => StorageError::DatabaseError(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StorageError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StorageError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::InvalidJson(err.to_string())
    }
}

impl From<sqlx::Error> for JobServiceError {
    fn from(err: sqlx::Error) -> Self {
        JobServiceError::Storage(err.into())
    }
}
