// Repository layer: store contracts used by the scheduler and lease manager,
// with PostgreSQL and in-memory implementations

pub mod job;
pub mod management;
pub mod memory;

pub use job::PgJobRepository;
pub use management::PgJobServiceManagementRepository;
pub use memory::{InMemoryJobRepository, InMemoryJobServiceManagementRepository};

use crate::errors::StorageError;
use crate::models::{JobDetails, JobDetailsPatch, JobServiceManagementInfo, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// Durable store of job records
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Load a job by id
    async fn get(&self, id: &str) -> Result<Option<JobDetails>, StorageError>;

    /// Whether a job with this id is stored
    async fn exists(&self, id: &str) -> Result<bool, StorageError>;

    /// Insert or replace a job, returning the stored snapshot
    async fn save(&self, job: &JobDetails) -> Result<JobDetails, StorageError>;

    /// Delete a job, returning what was removed
    async fn delete(&self, id: &str) -> Result<Option<JobDetails>, StorageError>;

    /// Apply `patch` onto the stored job; `None` if the job does not exist
    async fn merge(
        &self,
        id: &str,
        patch: &JobDetailsPatch,
    ) -> Result<Option<JobDetails>, StorageError>;

    /// Jobs in one of `statuses` firing in `[from, to)`, highest priority first.
    ///
    /// The stream is lazy and finite; calling again restarts the query.
    fn find_by_status_between_dates_order_by_priority<'a>(
        &'a self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        statuses: &'a [JobStatus],
    ) -> BoxStream<'a, Result<JobDetails, StorageError>>;
}

/// Read-modify-write function applied by `get_and_update`
pub type ManagementUpdate =
    dyn Fn(JobServiceManagementInfo) -> JobServiceManagementInfo + Send + Sync;

/// Durable store of lease rows
#[async_trait]
pub trait JobServiceManagementRepository: Send + Sync {
    /// Upsert `{id, token}` with an empty heartbeat
    async fn set(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<JobServiceManagementInfo, StorageError>;

    /// Set the heartbeat to `now` if the stored token still equals
    /// `info.token`.
    ///
    /// `now` comes from the caller's clock, the same one that judges expiry.
    async fn heartbeat(
        &self,
        info: &JobServiceManagementInfo,
        now: DateTime<Utc>,
    ) -> Result<Option<JobServiceManagementInfo>, StorageError>;

    /// Clear token and heartbeat if the stored token still equals `info.token`
    async fn release(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<Option<JobServiceManagementInfo>, StorageError>;

    /// Atomically transform the stored row; `None` if no row exists
    async fn get_and_update(
        &self,
        id: &str,
        update: &ManagementUpdate,
    ) -> Result<Option<JobServiceManagementInfo>, StorageError>;
}
