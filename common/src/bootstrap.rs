// Bootstrap utilities for binary initialization

use crate::config::{Settings, StorageBackend};
use crate::db::repositories::{
    InMemoryJobRepository, InMemoryJobServiceManagementRepository, JobRepository,
    JobServiceManagementRepository, PgJobRepository, PgJobServiceManagementRepository,
};
use crate::db::DbPool;
use crate::executor::{HttpExecutor, JobExecutor, RecipientExecutor, SinkExecutor};
use crate::queue::NatsClient;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Stores backing the scheduler and the lease manager
pub struct Repositories {
    pub jobs: Arc<dyn JobRepository>,
    pub management: Arc<dyn JobServiceManagementRepository>,
    /// Present for the PostgreSQL backend
    pub pool: Option<DbPool>,
}

/// Initialize database pool
///
/// # Errors
/// Returns error if database pool initialization fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Build the job and lease stores for the configured backend
///
/// # Errors
/// Returns error if the database cannot be reached or migrated
#[tracing::instrument(skip(settings))]
pub async fn build_repositories(settings: &Settings) -> Result<Repositories> {
    match settings.storage.backend {
        StorageBackend::Postgres => {
            let pool = init_database_pool(settings).await?;
            if settings.database.run_migrations {
                pool.migrate()
                    .await
                    .context("Failed to run database migrations")?;
            }

            Ok(Repositories {
                jobs: Arc::new(PgJobRepository::new(pool.clone())),
                management: Arc::new(PgJobServiceManagementRepository::new(pool.clone())),
                pool: Some(pool),
            })
        }
        StorageBackend::Memory => {
            warn!("Using in-memory storage, jobs will not survive a restart");
            Ok(Repositories {
                jobs: Arc::new(InMemoryJobRepository::new()),
                management: Arc::new(InMemoryJobServiceManagementRepository::new()),
                pool: None,
            })
        }
    }
}

/// Initialize NATS client and make sure the command stream exists
///
/// # Errors
/// Returns error if NATS client or stream initialization fails
#[tracing::instrument(skip(settings))]
pub async fn init_nats_client(settings: &Settings) -> Result<NatsClient> {
    info!("Initializing NATS client");

    let nats_client = NatsClient::new(settings.nats.clone())
        .await
        .context("Failed to initialize NATS client")?;

    nats_client
        .initialize_stream()
        .await
        .context("Failed to initialize NATS stream")?;

    info!("NATS client initialized");
    Ok(nats_client)
}

/// Build the executor routing jobs to their recipient
///
/// Sink recipients are only served when a NATS client is available.
///
/// # Errors
/// Returns error if the HTTP client cannot be built
pub fn build_executor(
    settings: &Settings,
    nats: Option<&NatsClient>,
) -> Result<Arc<dyn JobExecutor>> {
    let http = HttpExecutor::new(settings.executor.default_timeout_seconds)
        .context("Failed to build HTTP executor")?;
    let sink = nats.map(|client| {
        Arc::new(SinkExecutor::new(client.client().clone())) as Arc<dyn JobExecutor>
    });

    Ok(Arc::new(RecipientExecutor::new(Arc::new(http), sink)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_needs_no_database() {
        let mut settings = Settings::default();
        settings.storage.backend = StorageBackend::Memory;

        let repositories = build_repositories(&settings).await.unwrap();
        assert!(repositories.pool.is_none());
        assert!(repositories.jobs.get("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_build_executor_without_nats() {
        let settings = Settings::default();
        assert!(build_executor(&settings, None).is_ok());
    }
}
