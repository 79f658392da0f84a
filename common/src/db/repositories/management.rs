// PostgreSQL lease repository
//
// Heartbeat and release are conditional updates guarded by the caller's
// token; a lost race shows up as zero affected rows, never as an error.

use super::{JobServiceManagementRepository, ManagementUpdate};
use crate::db::DbPool;
use crate::errors::StorageError;
use crate::models::JobServiceManagementInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

/// Repository for the `job_service_management` table
pub struct PgJobServiceManagementRepository {
    pool: DbPool,
}

impl PgJobServiceManagementRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobServiceManagementRepository for PgJobServiceManagementRepository {
    #[instrument(skip(self, info), fields(slot = %info.id))]
    async fn set(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<JobServiceManagementInfo, StorageError> {
        let stored = sqlx::query_as::<_, JobServiceManagementInfo>(
            r#"
            INSERT INTO job_service_management (id, token, last_heartbeat)
            VALUES ($1, $2, NULL)
            ON CONFLICT (id) DO UPDATE SET
                token = EXCLUDED.token,
                last_heartbeat = NULL
            RETURNING id, token, last_heartbeat
            "#,
        )
        .bind(&info.id)
        .bind(&info.token)
        .fetch_one(self.pool.pool())
        .await?;

        debug!("Lease slot claimed");
        Ok(stored)
    }

    #[instrument(skip(self, info), fields(slot = %info.id))]
    async fn heartbeat(
        &self,
        info: &JobServiceManagementInfo,
        now: DateTime<Utc>,
    ) -> Result<Option<JobServiceManagementInfo>, StorageError> {
        let stored = sqlx::query_as::<_, JobServiceManagementInfo>(
            r#"
            UPDATE job_service_management
            SET last_heartbeat = $3
            WHERE id = $1 AND token = $2
            RETURNING id, token, last_heartbeat
            "#,
        )
        .bind(&info.id)
        .bind(&info.token)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await?;

        Ok(stored)
    }

    #[instrument(skip(self, info), fields(slot = %info.id))]
    async fn release(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<Option<JobServiceManagementInfo>, StorageError> {
        let stored = sqlx::query_as::<_, JobServiceManagementInfo>(
            r#"
            UPDATE job_service_management
            SET token = NULL, last_heartbeat = NULL
            WHERE id = $1 AND token = $2
            RETURNING id, token, last_heartbeat
            "#,
        )
        .bind(&info.id)
        .bind(&info.token)
        .fetch_optional(self.pool.pool())
        .await?;

        Ok(stored)
    }

    #[instrument(skip(self, update))]
    async fn get_and_update(
        &self,
        id: &str,
        update: &ManagementUpdate,
    ) -> Result<Option<JobServiceManagementInfo>, StorageError> {
        let mut tx = self.pool.pool().begin().await?;

        let current = sqlx::query_as::<_, JobServiceManagementInfo>(
            "SELECT id, token, last_heartbeat FROM job_service_management WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(current) = current else {
            tx.rollback().await?;
            return Ok(None);
        };

        let updated = update(current);
        let stored = sqlx::query_as::<_, JobServiceManagementInfo>(
            r#"
            UPDATE job_service_management
            SET token = $2, last_heartbeat = $3
            WHERE id = $1
            RETURNING id, token, last_heartbeat
            "#,
        )
        .bind(id)
        .bind(&updated.token)
        .bind(updated.last_heartbeat)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(stored))
    }
}
