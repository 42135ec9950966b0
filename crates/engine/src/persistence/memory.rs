//! In-memory implementation of JobStore

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::job::{DispatchJob, JobResolution, JobStatus, NewDispatch};

/// In-memory implementation of JobStore
///
/// Each primitive runs under one write lock, so every conditional update is
/// a single compare-and-swap exactly like the SQL statement it stands in
/// for. Several engines sharing one `Arc<InMemoryJobStore>` therefore
/// compete for jobs the same way separate processes compete for rows.
///
/// # Example
///
/// ```
/// use docdispatch_engine::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// assert_eq!(store.job_count(), 0);
/// ```
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, DispatchJob>>,
}

impl InMemoryJobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of jobs
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Number of jobs in the given status
    pub fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|j| j.status == status)
            .count()
    }

    /// Insert a record as-is (for seeding tests with arbitrary states)
    pub fn insert(&self, job: DispatchJob) {
        self.jobs.write().insert(job.id, job);
    }

    fn update_existing(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut DispatchJob),
    ) -> Option<DispatchJob> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id)?;
        f(job);
        job.updated_at = now;
        Some(job.clone())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn scan_claimable(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let jobs = self.jobs.read();
        let mut candidates: Vec<&DispatchJob> =
            jobs.values().filter(|j| j.is_claimable(now)).collect();
        candidates.sort_by_key(|j| (j.created_at, j.id));

        Ok(candidates.into_iter().take(limit).map(|j| j.id).collect())
    }

    async fn try_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&id) {
            Some(job) if job.is_claimable(now) => {
                job.status = JobStatus::Processing;
                job.lock_owner = Some(worker_id.to_string());
                job.lease_expiry = Some(lease_until(now, lease));
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_renew(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&id) {
            Some(job) if job.is_owned_by(worker_id, now) => {
                job.lease_expiry = Some(lease_until(now, lease));
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn read_owned(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        let jobs = self.jobs.read();
        Ok(jobs
            .get(&id)
            .filter(|j| j.is_owned_by(worker_id, now))
            .cloned())
    }

    async fn resolve(
        &self,
        id: Uuid,
        worker_id: &str,
        resolution: &JobResolution,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        match jobs.get_mut(&id) {
            Some(job)
                if job.status == JobStatus::Processing
                    && job.lock_owner.as_deref() == Some(worker_id) =>
            {
                job.status = resolution.status;
                job.retry_count = resolution.retry_count;
                job.last_error = resolution.last_error.clone();
                job.clear_lease();
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let mut jobs = self.jobs.write();
        let mut reclaimed = Vec::new();
        for job in jobs.values_mut() {
            let expired = job.lease_expiry.map_or(true, |until| until < now);
            if job.status == JobStatus::Processing && expired {
                job.status = JobStatus::Pending;
                job.clear_lease();
                job.updated_at = now;
                reclaimed.push(job.id);
            }
        }
        Ok(reclaimed)
    }

    async fn create(
        &self,
        new: NewDispatch,
        now: DateTime<Utc>,
    ) -> Result<DispatchJob, StoreError> {
        let job = DispatchJob::new(new, now);
        self.jobs.write().insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DispatchJob>, StoreError> {
        Ok(self.jobs.read().get(&id).cloned())
    }

    async fn list(&self, page: Pagination) -> Result<Vec<DispatchJob>, StoreError> {
        let jobs = self.jobs.read();
        let mut all: Vec<&DispatchJob> = jobs.values().collect();
        all.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        Ok(all
            .into_iter()
            .skip(page.skip as usize)
            .take(page.take as usize)
            .cloned()
            .collect())
    }

    async fn force_requeue(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        Ok(self.update_existing(id, now, |job| {
            job.status = JobStatus::Pending;
            job.clear_lease();
        }))
    }

    async fn release_lock(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        Ok(self.update_existing(id, now, DispatchJob::clear_lease))
    }

    async fn clear_error(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        Ok(self.update_existing(id, now, |job| job.last_error = None))
    }

    async fn reset_retries(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        Ok(self.update_existing(id, now, |job| job.retry_count = 0))
    }

    async fn snapshot(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<StatusSnapshot, StoreError> {
        let jobs = self.jobs.read();
        let mut snapshot = StatusSnapshot::default();
        for job in jobs.values() {
            snapshot.total += 1;
            match job.status {
                JobStatus::Pending => snapshot.pending += 1,
                JobStatus::Processing => {
                    snapshot.processing += 1;
                    if job.updated_at < stale_before {
                        snapshot.stale_processing += 1;
                    }
                }
                JobStatus::Completed => snapshot.completed += 1,
                JobStatus::Failed => snapshot.failed += 1,
            }
            if job.is_locked(now) {
                snapshot.locked += 1;
            }
        }
        Ok(snapshot)
    }

    async fn recent(
        &self,
        take: u32,
        include_completed: bool,
    ) -> Result<Vec<DispatchJob>, StoreError> {
        let jobs = self.jobs.read();
        let mut rows: Vec<&DispatchJob> = jobs
            .values()
            .filter(|j| include_completed || j.status != JobStatus::Completed)
            .collect();
        rows.sort_by(|a, b| (b.updated_at, b.created_at).cmp(&(a.updated_at, a.created_at)));

        Ok(rows.into_iter().take(take as usize).cloned().collect())
    }
}
