// PostgreSQL job repository

use super::JobRepository;
use crate::db::DbPool;
use crate::errors::StorageError;
use crate::models::{JobDetails, JobDetailsPatch, JobStatus, TimeoutUnit};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use std::str::FromStr;
use tracing::instrument;

const COLUMNS: &str = "id, correlation_id, status, last_update, retries, execution_counter, \
     scheduled_id, priority, recipient, job_trigger, fire_time, execution_timeout, \
     execution_timeout_unit, created";

/// Repository for job records stored in the `job_details` table
pub struct PgJobRepository {
    pool: DbPool,
}

impl PgJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn invalid_row(reason: impl Into<String>) -> StorageError {
    StorageError::InvalidRow {
        entity: "job_details".to_string(),
        reason: reason.into(),
    }
}

fn job_from_row(row: &PgRow) -> Result<JobDetails, StorageError> {
    let status: String = row.try_get("status")?;
    let unit: String = row.try_get("execution_timeout_unit")?;
    let retries: i32 = row.try_get("retries")?;
    let execution_counter: i32 = row.try_get("execution_counter")?;
    let execution_timeout: Option<i64> = row.try_get("execution_timeout")?;
    let trigger: serde_json::Value = row.try_get("job_trigger")?;
    let recipient: serde_json::Value = row.try_get("recipient")?;

    Ok(JobDetails {
        id: row.try_get("id")?,
        correlation_id: row.try_get("correlation_id")?,
        status: JobStatus::from_str(&status).map_err(invalid_row)?,
        trigger: serde_json::from_value(trigger)?,
        recipient: serde_json::from_value(recipient)?,
        retries: u32::try_from(retries).map_err(|e| invalid_row(e.to_string()))?,
        execution_counter: u32::try_from(execution_counter)
            .map_err(|e| invalid_row(e.to_string()))?,
        scheduled_id: row.try_get("scheduled_id")?,
        priority: row.try_get("priority")?,
        execution_timeout: execution_timeout.map(|t| t.max(0) as u64),
        execution_timeout_unit: TimeoutUnit::from_str(&unit).map_err(invalid_row)?,
        last_update: row.try_get("last_update")?,
        created: row.try_get("created")?,
    })
}

/// Upsert statement binding owned copies of the job's columns
fn upsert_query(job: &JobDetails) -> Result<Query<'static, Postgres, PgArguments>, StorageError> {
    let trigger = serde_json::to_value(&job.trigger)?;
    let recipient = serde_json::to_value(&job.recipient)?;

    Ok(sqlx::query(
        r#"
        INSERT INTO job_details (
            id, correlation_id, status, last_update, retries, execution_counter,
            scheduled_id, priority, recipient, job_trigger, fire_time,
            execution_timeout, execution_timeout_unit, created
        )
        VALUES ($1, $2, $3, NOW(), $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW())
        ON CONFLICT (id) DO UPDATE SET
            correlation_id = EXCLUDED.correlation_id,
            status = EXCLUDED.status,
            last_update = NOW(),
            retries = EXCLUDED.retries,
            execution_counter = EXCLUDED.execution_counter,
            scheduled_id = EXCLUDED.scheduled_id,
            priority = EXCLUDED.priority,
            recipient = EXCLUDED.recipient,
            job_trigger = EXCLUDED.job_trigger,
            fire_time = EXCLUDED.fire_time,
            execution_timeout = EXCLUDED.execution_timeout,
            execution_timeout_unit = EXCLUDED.execution_timeout_unit
        RETURNING id, correlation_id, status, last_update, retries, execution_counter,
            scheduled_id, priority, recipient, job_trigger, fire_time, execution_timeout,
            execution_timeout_unit, created
        "#,
    )
    .bind(job.id.clone())
    .bind(job.correlation_id.clone())
    .bind(job.status.as_str())
    .bind(job.retries as i32)
    .bind(job.execution_counter as i32)
    .bind(job.scheduled_id.clone())
    .bind(job.priority)
    .bind(recipient)
    .bind(trigger)
    .bind(job.fire_time())
    .bind(job.execution_timeout.map(|t| t as i64))
    .bind(job.execution_timeout_unit.as_str()))
}

#[async_trait]
impl JobRepository for PgJobRepository {
    #[instrument(skip(self))]
    async fn get(&self, id: &str) -> Result<Option<JobDetails>, StorageError> {
        let row = sqlx::query(&format!("SELECT {} FROM job_details WHERE id = $1", COLUMNS))
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM job_details WHERE id = $1)")
                .bind(id)
                .fetch_one(self.pool.pool())
                .await?;
        Ok(exists)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status))]
    async fn save(&self, job: &JobDetails) -> Result<JobDetails, StorageError> {
        let row = upsert_query(job)?.fetch_one(self.pool.pool()).await?;
        tracing::debug!("Job saved");
        job_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<Option<JobDetails>, StorageError> {
        let row = sqlx::query(&format!(
            "DELETE FROM job_details WHERE id = $1 RETURNING {}",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await?;

        if row.is_some() {
            tracing::debug!(job_id = %id, "Job deleted");
        }
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, patch))]
    async fn merge(
        &self,
        id: &str,
        patch: &JobDetailsPatch,
    ) -> Result<Option<JobDetails>, StorageError> {
        let mut tx = self.pool.pool().begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM job_details WHERE id = $1 FOR UPDATE",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let merged = patch.apply(job_from_row(&row)?);
        let row = upsert_query(&merged)?.fetch_one(&mut *tx).await?;
        tx.commit().await?;

        tracing::debug!(job_id = %id, "Job merged");
        job_from_row(&row).map(Some)
    }

    fn find_by_status_between_dates_order_by_priority<'a>(
        &'a self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        statuses: &'a [JobStatus],
    ) -> BoxStream<'a, Result<JobDetails, StorageError>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();

        sqlx::query(
            r#"
            SELECT id, correlation_id, status, last_update, retries, execution_counter,
                scheduled_id, priority, recipient, job_trigger, fire_time, execution_timeout,
                execution_timeout_unit, created
            FROM job_details
            WHERE fire_time >= $1 AND fire_time < $2 AND status = ANY($3)
            ORDER BY priority DESC, fire_time ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(statuses)
        .fetch(self.pool.pool())
        .map(|row| row.map_err(StorageError::from).and_then(|row| job_from_row(&row)))
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HttpMethod, Recipient};
    use crate::trigger::Trigger;

    #[test]
    fn test_upsert_query_serializes_json_columns() {
        let job = JobDetails::new(
            "job-1",
            Trigger::point_in_time(Utc::now()),
            Recipient::Http {
                url: "http://localhost/cb".to_string(),
                method: HttpMethod::Post,
                headers: Default::default(),
                payload: None,
            },
        );
        assert!(upsert_query(&job).is_ok());
    }

    #[test]
    fn test_invalid_row_names_table() {
        let err = invalid_row("bad status");
        assert!(err.to_string().contains("job_details"));
    }
}
