//! Bounded-concurrency dispatch of claimed jobs
//!
//! # Architecture
//!
//! ```text
//! claimed ids ──▶ Semaphore (max_concurrency) ──▶ JoinSet
//!                   │ blocks admission               │ [job 1] [job 2] ... [job C]
//!                   │ when saturated                 │  each: work slices ∥ LeaseMonitor
//!                   ▼                                ▼
//!              shutdown stops admission        dispatch() returns once all finish
//! ```

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::processor::JobProcessor;
use super::resolver::JobOutcome;
use crate::metrics::{stage, DispatchMetrics};

/// Tally of one dispatch round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub launched: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    pub lease_lost: usize,
    pub cancelled: usize,
    /// Tasks that returned a store error or panicked
    pub faulted: usize,
    /// Claimed jobs never admitted because shutdown arrived first
    pub not_admitted: usize,
}

impl DispatchSummary {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Requeued => self.requeued += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::LeaseLost => self.lease_lost += 1,
            JobOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Fans claimed jobs out to at most `max_concurrency` concurrent tasks
pub struct Dispatcher {
    processor: Arc<JobProcessor>,
    metrics: DispatchMetrics,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(processor: Arc<JobProcessor>, metrics: DispatchMetrics, max_concurrency: usize) -> Self {
        Self {
            processor,
            metrics,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Free execution slots right now
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run every claimed job, waiting for a slot when saturated
    ///
    /// Returns after every launched task has finished. Once `cancel` fires no
    /// further jobs are admitted; their leases are left to expire.
    pub async fn dispatch(&self, jobs: Vec<Uuid>, cancel: &CancellationToken) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let mut tasks = JoinSet::new();
        let total = jobs.len();

        for job_id in jobs {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("Dispatcher semaphore closed: {}", e);
                        break;
                    }
                },
            };

            let processor = Arc::clone(&self.processor);
            let token = cancel.clone();
            tasks.spawn(async move {
                let outcome = processor.process(job_id, token).await;
                drop(permit);
                (job_id, outcome)
            });
            summary.launched += 1;
        }

        summary.not_admitted = total - summary.launched;
        if summary.not_admitted > 0 {
            info!(
                count = summary.not_admitted,
                "Shutdown before admission, leaving claimed jobs to expire"
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => summary.record(outcome),
                Ok((job_id, Err(e))) => {
                    summary.faulted += 1;
                    error!(%job_id, "Dispatch failed: {}", e);
                }
                Err(e) => {
                    summary.faulted += 1;
                    self.metrics.record_error(stage::PROCESS);
                    error!("Dispatch task panicked: {}", e);
                }
            }
        }

        debug!(?summary, "Dispatch round finished");
        summary
    }
}
