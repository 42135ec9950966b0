//! Outcome resolution
//!
//! Maps a delivery verdict onto the job state machine:
//!
//! ```text
//! Pending ──claim──▶ Processing ──pass──────────────────▶ Completed
//!    ▲                   │
//!    └──fail, retry < N──┤
//!                        └──fail, retry >= N────────────▶ Failed
//! ```

use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::job::{DispatchJob, JobResolution, JobStatus};
use crate::metrics::{result, stage, DispatchMetrics};
use crate::persistence::{JobStore, StoreError};

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
}

/// Decides whether a delivery attempt succeeded
///
/// Implemented for any `Fn(&DispatchJob) -> Verdict`, so tests can script
/// outcomes with a closure.
///
/// `decide` is synchronous and runs on the async runtime once the work
/// slices finish, while the job's lease is still being renewed. It must
/// return promptly: blocking stalls a runtime worker thread. Slow delivery
/// belongs in the sliced work phase. A verdict reached after the lease was
/// lost, or after shutdown, is discarded without a write.
pub trait VerdictStrategy: Send + Sync + 'static {
    fn decide(&self, job: &DispatchJob) -> Verdict;
}

impl<F> VerdictStrategy for F
where
    F: Fn(&DispatchJob) -> Verdict + Send + Sync + 'static,
{
    fn decide(&self, job: &DispatchJob) -> Verdict {
        self(job)
    }
}

/// Passes with fixed probability
#[derive(Debug, Clone)]
pub struct RandomVerdict {
    pass_rate: f64,
}

impl Default for RandomVerdict {
    fn default() -> Self {
        Self { pass_rate: 0.8 }
    }
}

impl RandomVerdict {
    pub fn new(pass_rate: f64) -> Self {
        Self {
            pass_rate: pass_rate.clamp(0.0, 1.0),
        }
    }
}

impl VerdictStrategy for RandomVerdict {
    fn decide(&self, _job: &DispatchJob) -> Verdict {
        if rand::thread_rng().gen_bool(self.pass_rate) {
            Verdict::Pass
        } else {
            Verdict::Fail("simulated transient failure".to_string())
        }
    }
}

/// How a claimed job left this worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Requeued,
    Failed,
    /// Ownership was gone before the outcome could be written
    LeaseLost,
    /// Shutdown interrupted the work; nothing was written
    Cancelled,
}

impl JobOutcome {
    /// Label for `dispatch_processed_total`, if the outcome is counted there
    pub fn metric_label(&self) -> Option<&'static str> {
        match self {
            JobOutcome::Completed => Some(result::COMPLETED),
            JobOutcome::Requeued => Some(result::REQUEUED),
            JobOutcome::Failed => Some(result::FAILED),
            JobOutcome::LeaseLost => Some(result::LEASE_LOST),
            JobOutcome::Cancelled => None,
        }
    }
}

/// Next state for a job whose attempt ended with `verdict`
pub fn decide(retry_count: u32, verdict: &Verdict, max_attempts: u32) -> JobResolution {
    match verdict {
        Verdict::Pass => JobResolution {
            status: JobStatus::Completed,
            retry_count,
            last_error: None,
        },
        Verdict::Fail(reason) => {
            let retry_count = retry_count.saturating_add(1);
            if retry_count >= max_attempts {
                JobResolution {
                    status: JobStatus::Failed,
                    retry_count,
                    last_error: Some(format!(
                        "delivery failed after {} attempts: {}",
                        retry_count, reason
                    )),
                }
            } else {
                JobResolution {
                    status: JobStatus::Pending,
                    retry_count,
                    last_error: Some(reason.clone()),
                }
            }
        }
    }
}

/// Writes verdicts back to the store under the worker's ownership
pub struct OutcomeResolver {
    store: Arc<dyn JobStore>,
    metrics: DispatchMetrics,
    worker_id: String,
    max_attempts: u32,
}

impl OutcomeResolver {
    pub fn new(
        store: Arc<dyn JobStore>,
        metrics: DispatchMetrics,
        worker_id: String,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            metrics,
            worker_id,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Apply `verdict` to `job` and count the outcome
    ///
    /// A store error is counted under the `process` stage and returned; the
    /// job keeps its lease and is reclaimed once the lease lapses.
    pub async fn resolve(
        &self,
        job: &DispatchJob,
        verdict: &Verdict,
    ) -> Result<JobOutcome, StoreError> {
        let resolution = decide(job.retry_count, verdict, self.max_attempts);

        let applied = match self
            .store
            .resolve(job.id, &self.worker_id, &resolution, Utc::now())
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                self.metrics.record_error(stage::PROCESS);
                return Err(e);
            }
        };

        let outcome = if !applied {
            warn!(job_id = %job.id, "Lease lost before outcome was written");
            JobOutcome::LeaseLost
        } else {
            match resolution.status {
                JobStatus::Completed => {
                    info!(job_id = %job.id, "Dispatch completed");
                    JobOutcome::Completed
                }
                JobStatus::Failed => {
                    warn!(
                        job_id = %job.id,
                        retry_count = resolution.retry_count,
                        "Dispatch failed permanently"
                    );
                    JobOutcome::Failed
                }
                _ => {
                    debug!(
                        job_id = %job.id,
                        retry_count = resolution.retry_count,
                        "Dispatch requeued after transient failure"
                    );
                    JobOutcome::Requeued
                }
            }
        };

        if let Some(label) = outcome.metric_label() {
            self.metrics.record_processed(label);
        }
        Ok(outcome)
    }
}
