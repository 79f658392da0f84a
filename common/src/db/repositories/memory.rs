// In-memory stores, used by tests and by `storage.backend = "memory"`

use super::{JobRepository, JobServiceManagementRepository, ManagementUpdate};
use crate::clock::{Clock, SystemClock};
use crate::errors::StorageError;
use crate::models::{JobDetails, JobDetailsPatch, JobServiceManagementInfo, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Job store backed by a `HashMap`. Nothing survives a restart.
pub struct InMemoryJobRepository {
    jobs: Mutex<HashMap<String, JobDetails>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of stored jobs
    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn get(&self, id: &str) -> Result<Option<JobDetails>, StorageError> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(id).cloned())
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.contains_key(id))
    }

    async fn save(&self, job: &JobDetails) -> Result<JobDetails, StorageError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let created = jobs.get(&job.id).and_then(|j| j.created).unwrap_or(now);

        let mut stored = job.clone();
        stored.created = Some(created);
        stored.last_update = Some(now);
        jobs.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &str) -> Result<Option<JobDetails>, StorageError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.remove(id))
    }

    async fn merge(
        &self,
        id: &str,
        patch: &JobDetailsPatch,
    ) -> Result<Option<JobDetails>, StorageError> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(current) = jobs.get(id).cloned() else {
            return Ok(None);
        };

        let mut merged = patch.apply(current);
        merged.last_update = Some(now);
        jobs.insert(id.to_string(), merged.clone());
        Ok(Some(merged))
    }

    fn find_by_status_between_dates_order_by_priority<'a>(
        &'a self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        statuses: &'a [JobStatus],
    ) -> BoxStream<'a, Result<JobDetails, StorageError>> {
        let mut matching: Vec<JobDetails> = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.values()
                .filter(|job| statuses.contains(&job.status))
                .filter(|job| job.fire_time().is_some_and(|t| t >= from && t < to))
                .cloned()
                .collect()
        };
        matching.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.fire_time().cmp(&b.fire_time()))
        });

        stream::iter(matching.into_iter().map(Ok)).boxed()
    }
}

/// Lease store backed by a `HashMap`
pub struct InMemoryJobServiceManagementRepository {
    rows: Mutex<HashMap<String, JobServiceManagementInfo>>,
}

impl InMemoryJobServiceManagementRepository {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    /// Current row of a slot
    pub fn row(&self, id: &str) -> Option<JobServiceManagementInfo> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl Default for InMemoryJobServiceManagementRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobServiceManagementRepository for InMemoryJobServiceManagementRepository {
    async fn set(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<JobServiceManagementInfo, StorageError> {
        let stored = JobServiceManagementInfo {
            id: info.id.clone(),
            token: info.token.clone(),
            last_heartbeat: None,
        };
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        rows.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn heartbeat(
        &self,
        info: &JobServiceManagementInfo,
        now: DateTime<Utc>,
    ) -> Result<Option<JobServiceManagementInfo>, StorageError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        match rows.get_mut(&info.id) {
            Some(row) if row.token.is_some() && row.token == info.token => {
                row.last_heartbeat = Some(now);
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(
        &self,
        info: &JobServiceManagementInfo,
    ) -> Result<Option<JobServiceManagementInfo>, StorageError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        match rows.get_mut(&info.id) {
            Some(row) if row.token.is_some() && row.token == info.token => {
                row.token = None;
                row.last_heartbeat = None;
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get_and_update(
        &self,
        id: &str,
        update: &ManagementUpdate,
    ) -> Result<Option<JobServiceManagementInfo>, StorageError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let Some(current) = rows.get(id).cloned() else {
            return Ok(None);
        };
        let updated = update(current);
        rows.insert(id.to_string(), updated.clone());
        Ok(Some(updated))
    }
}
