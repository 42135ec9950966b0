//! Candidate scanning and claiming
//!
//! One poll reads up to `batch_size` claimable ids oldest first, then tries
//! to claim each with a single conditional update. Losing a claim race to
//! another worker is a silent miss.
//!
//! The scan is also capped by the caller's free execution slots: a claimed
//! job has no renewal running until it is admitted, so claiming more than
//! can start at once would let those leases lapse while they queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::metrics::{stage, DispatchMetrics};
use crate::persistence::{JobStore, StoreError};

pub struct JobPoller {
    store: Arc<dyn JobStore>,
    metrics: DispatchMetrics,
    worker_id: String,
    batch_size: usize,
    lease_duration: Duration,
    poll_interval: Duration,
}

impl JobPoller {
    pub fn new(store: Arc<dyn JobStore>, metrics: DispatchMetrics, config: &DispatchConfig) -> Self {
        Self {
            store,
            metrics,
            worker_id: config.worker_id.clone(),
            batch_size: config.batch_size.max(1),
            lease_duration: config.lease_duration,
            poll_interval: config.poll_interval,
        }
    }

    /// Scan for candidates and claim as many as possible, at most `slots`
    ///
    /// Returns the ids this worker now owns. A failed scan is counted and
    /// returned; a failed claim is counted and skipped.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&self, slots: usize) -> Result<Vec<Uuid>, StoreError> {
        let limit = self.batch_size.min(slots);
        if limit == 0 {
            trace!("No free slots, skipping scan");
            return Ok(vec![]);
        }

        let now = Utc::now();
        let candidates = match self.store.scan_claimable(limit, now).await {
            Ok(ids) => ids,
            Err(e) => {
                self.metrics.record_error(stage::SCAN);
                return Err(e);
            }
        };

        if candidates.is_empty() {
            trace!("No claimable jobs");
            return Ok(vec![]);
        }

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            match self
                .store
                .try_claim(id, &self.worker_id, Utc::now(), self.lease_duration)
                .await
            {
                Ok(true) => {
                    self.metrics.claimed.inc();
                    claimed.push(id);
                }
                Ok(false) => {
                    trace!(job_id = %id, "Claim race lost");
                }
                Err(e) => {
                    self.metrics.record_error(stage::SCAN);
                    error!(job_id = %id, "Claim failed: {}", e);
                }
            }
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "Claimed jobs");
        }
        Ok(claimed)
    }

    /// Wait one poll interval
    ///
    /// Returns `true` if shutdown was signalled during the wait.
    pub async fn wait(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => false,
            _ = token.cancelled() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, NewDispatch};
    use crate::persistence::InMemoryJobStore;

    fn config(worker: &str, batch: usize) -> DispatchConfig {
        DispatchConfig::new()
            .with_worker_id(worker)
            .with_batch_size(batch)
            .with_poll_interval(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_poll_claims_oldest_batch() {
        let store = Arc::new(InMemoryJobStore::new());
        let metrics = DispatchMetrics::new();
        let base = Utc::now() - chrono::Duration::seconds(10);
        let mut ids = Vec::new();
        for i in 0..4 {
            let job = store
                .create(
                    NewDispatch::new("a@example.com", format!("{i}.pdf")),
                    base + chrono::Duration::seconds(i),
                )
                .await
                .unwrap();
            ids.push(job.id);
        }

        let poller = JobPoller::new(store.clone(), metrics.clone(), &config("me", 3));
        let claimed = poller.poll(usize::MAX).await.unwrap();

        assert_eq!(claimed, ids[..3].to_vec());
        assert_eq!(metrics.claimed.get() as u64, 3);
        for id in &claimed {
            let job = store.get(*id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Processing);
            assert_eq!(job.lock_owner.as_deref(), Some("me"));
            assert!(job.lease_expiry.unwrap() > Utc::now());
        }
    }

    #[tokio::test]
    async fn test_poll_never_claims_more_than_free_slots() {
        let store = Arc::new(InMemoryJobStore::new());
        let metrics = DispatchMetrics::new();
        for i in 0..4 {
            store
                .create(NewDispatch::new("a@example.com", format!("{i}.pdf")), Utc::now())
                .await
                .unwrap();
        }

        let poller = JobPoller::new(store.clone(), metrics.clone(), &config("me", 4));
        assert!(poller.poll(0).await.unwrap().is_empty());
        assert_eq!(poller.poll(1).await.unwrap().len(), 1);

        assert_eq!(metrics.claimed.get() as u64, 1);
        assert_eq!(store.count_with_status(JobStatus::Pending), 3);
    }

    #[tokio::test]
    async fn test_competing_pollers_split_the_backlog() {
        let store = Arc::new(InMemoryJobStore::new());
        for i in 0..6 {
            store
                .create(NewDispatch::new("a@example.com", format!("{i}.pdf")), Utc::now())
                .await
                .unwrap();
        }

        let a = JobPoller::new(store.clone(), DispatchMetrics::new(), &config("a", 6));
        let b = JobPoller::new(store.clone(), DispatchMetrics::new(), &config("b", 6));
        let (claimed_a, claimed_b) = tokio::join!(a.poll(usize::MAX), b.poll(usize::MAX));
        let (claimed_a, claimed_b) = (claimed_a.unwrap(), claimed_b.unwrap());

        assert_eq!(claimed_a.len() + claimed_b.len(), 6);
        assert!(claimed_a.iter().all(|id| !claimed_b.contains(id)));
    }

    #[tokio::test]
    async fn test_wait_returns_early_on_shutdown() {
        let store = Arc::new(InMemoryJobStore::new());
        let poller = JobPoller::new(store, DispatchMetrics::new(), &config("me", 1));
        let token = CancellationToken::new();
        token.cancel();
        assert!(poller.wait(&token).await);
    }
}
