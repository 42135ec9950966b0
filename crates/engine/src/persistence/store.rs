//! JobStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{DispatchJob, JobResolution, NewDispatch};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Row could not be decoded into a job record
    #[error("decode error: {0}")]
    Decode(String),
}

/// Pagination parameters for listing jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub skip: u32,
    pub take: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { skip: 0, take: 50 }
    }
}

impl Pagination {
    /// Maximum page size accepted by [`Pagination::clamped`]
    pub const MAX_TAKE: i64 = 200;

    /// Normalize raw query parameters: negative skip becomes 0, a
    /// non-positive take becomes 50, and take is capped at 200
    pub fn clamped(skip: i64, take: i64) -> Self {
        let skip = skip.max(0).min(u32::MAX as i64) as u32;
        let take = if take <= 0 {
            50
        } else {
            take.min(Self::MAX_TAKE) as u32
        };
        Self { skip, take }
    }
}

/// Point-in-time counts over the whole job table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Rows whose lease expiry is in the future
    pub locked: u64,
    /// Processing rows not updated since the stale cutoff
    pub stale_processing: u64,
}

/// Shared job store
///
/// Every method is a single atomic statement against the store. The
/// conditional updates (`try_claim`, `try_renew`, `resolve`,
/// `reclaim_expired`) re-check their predicate at update time, which is the
/// only cross-process ownership primitive the engine trusts.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    // =========================================================================
    // Dispatch Protocol
    // =========================================================================

    /// Up to `limit` claimable ids, oldest `created_at` first
    async fn scan_claimable(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Claim one job if it is still claimable at update time
    ///
    /// Returns `false` when another worker won the race.
    async fn try_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Extend a lease that is still Processing, owned and unexpired
    async fn try_renew(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Read a job only if it is Processing, owned by `worker_id` and unexpired
    async fn read_owned(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError>;

    /// Move an owned Processing job to its resolved state, clearing the lease
    ///
    /// Returns `false` (and writes nothing) when the job is no longer
    /// Processing under `worker_id`.
    async fn resolve(
        &self,
        id: Uuid,
        worker_id: &str,
        resolution: &JobResolution,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Return every Processing job whose lease expired before `now` to Pending
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Submission and Query
    // =========================================================================

    /// Create a Pending, unleased job
    async fn create(&self, new: NewDispatch, now: DateTime<Utc>)
        -> Result<DispatchJob, StoreError>;

    /// Get a job by id
    async fn get(&self, id: Uuid) -> Result<Option<DispatchJob>, StoreError>;

    /// List jobs, newest `created_at` first
    async fn list(&self, page: Pagination) -> Result<Vec<DispatchJob>, StoreError>;

    // =========================================================================
    // Ops Remediation
    // =========================================================================

    /// Force a job back to Pending and clear its lease
    async fn force_requeue(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError>;

    /// Clear the lease fields without touching status
    async fn release_lock(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError>;

    /// Clear `last_error`
    async fn clear_error(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError>;

    /// Reset `retry_count` to zero
    async fn reset_retries(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError>;

    /// Counts by status, lease and staleness
    async fn snapshot(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<StatusSnapshot, StoreError>;

    /// Most recently updated jobs, optionally excluding Completed ones
    async fn recent(
        &self,
        take: u32,
        include_completed: bool,
    ) -> Result<Vec<DispatchJob>, StoreError>;
}

/// `now + lease`, saturating at the maximum representable instant
pub(crate) fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
