// PostgreSQL pool shared by the job and lease repositories

use crate::config::DatabaseConfig;
use crate::errors::StorageError;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

const APPLICATION_NAME: &str = "jobs-service";
/// Idle connections above `min_connections` are closed after this long
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Cloneable handle to the PostgreSQL pool
#[derive(Debug, Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    /// Connect and verify the database answers.
    ///
    /// Connections identify themselves as `jobs-service` in `pg_stat_activity`.
    ///
    /// # Errors
    /// `StorageError::ConnectionFailed` for a bad URL or an unreachable server
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StorageError> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| StorageError::ConnectionFailed(format!("Invalid database URL: {}", e)))?
            .application_name(APPLICATION_NAME);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(IDLE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let db_pool = Self { pool };
        db_pool.health_check().await?;

        info!(
            min_connections = config.min_connections,
            "Connected to PostgreSQL"
        );
        Ok(db_pool)
    }

    /// Wrap a pool created elsewhere, e.g. by a test harness
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create or upgrade the `job_details` and `job_service_management` tables
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        info!("Job tables migrated");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::HealthCheckFailed(e.to_string()))?;

        debug!(
            size = self.pool.size(),
            idle = self.pool.num_idle(),
            "Database reachable"
        );
        Ok(())
    }

    /// Wait for in-flight queries and close every connection
    pub async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }
}
