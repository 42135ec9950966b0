//! Dispatch job records and their lifecycle states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Lifecycle status of a dispatch job
///
/// ```text
/// Pending --(claim)--> Processing --(success)--> Completed
///                          |       --(failure, retries remain)--> Pending
///                          |       --(failure, retries exhausted)--> Failed
///                          +--(lease expired, reclaimed)--> Pending
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,

    /// Claimed by a worker holding a lease
    Processing,

    /// Delivered successfully
    Completed,

    /// Retries exhausted; needs manual remediation
    Failed,
}

impl JobStatus {
    /// Column representation used by the SQL store
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted dispatch job
///
/// `recipient_email` and `document_name` are payload fields; the engine never
/// reads them; they are handed to the verdict strategy untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct DispatchJob {
    pub id: Uuid,
    pub recipient_email: String,
    pub document_name: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub lock_owner: Option<String>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl DispatchJob {
    /// Build a fresh Pending, unleased record
    pub fn new(new: NewDispatch, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            recipient_email: new.recipient_email.trim().to_string(),
            document_name: new.document_name.trim().to_string(),
            status: JobStatus::Pending,
            retry_count: 0,
            lock_owner: None,
            lease_expiry: None,
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    /// Claimable iff Pending and the lease is absent or already expired
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.lease_expiry.map_or(true, |until| until < now)
    }

    /// Still Processing, owned by `worker_id`, and the lease has not expired
    pub fn is_owned_by(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.lock_owner.as_deref() == Some(worker_id)
            && self.lease_expiry.is_some_and(|until| until >= now)
    }

    /// Whether a lease is currently held (expiry in the future)
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry.is_some_and(|until| until > now)
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lock_owner = None;
        self.lease_expiry = None;
    }
}

/// Submission of a new dispatch job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(default, rename_all = "camelCase")]
pub struct NewDispatch {
    pub recipient_email: String,
    pub document_name: String,
}

impl NewDispatch {
    pub fn new(recipient_email: impl Into<String>, document_name: impl Into<String>) -> Self {
        Self {
            recipient_email: recipient_email.into(),
            document_name: document_name.into(),
        }
    }
}

/// Update written by the outcome resolver when a job leaves Processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResolution {
    pub status: JobStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
}
