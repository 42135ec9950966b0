//! Lease renewal monitor
//!
//! One monitor runs beside each in-flight job. It extends the lease on a
//! fixed cadence and stops either when its token is cancelled (the job
//! finished) or when a renewal no longer matches the row (the lease is gone).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::metrics::{stage, DispatchMetrics};
use crate::persistence::JobStore;

/// Why a renewal monitor stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// The token was cancelled before the next renewal was due
    Cancelled,
    /// A renewal matched zero rows
    Lost,
    /// A renewal could not reach the store; ownership can no longer be proven
    Faulted,
}

impl RenewalOutcome {
    /// Whether the job must abort without writing an outcome
    pub fn is_loss(&self) -> bool {
        !matches!(self, RenewalOutcome::Cancelled)
    }
}

pub struct LeaseMonitor {
    store: Arc<dyn JobStore>,
    metrics: DispatchMetrics,
    job_id: Uuid,
    worker_id: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl LeaseMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        metrics: DispatchMetrics,
        job_id: Uuid,
        worker_id: String,
        lease_duration: Duration,
        renew_interval: Duration,
    ) -> Self {
        Self {
            store,
            metrics,
            job_id,
            worker_id,
            lease_duration,
            renew_interval,
        }
    }

    /// Renew until `token` is cancelled or the lease is lost
    pub async fn run(self, token: CancellationToken) -> RenewalOutcome {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    trace!(job_id = %self.job_id, "Renewal monitor cancelled");
                    return RenewalOutcome::Cancelled;
                }
                _ = tokio::time::sleep(self.renew_interval) => {}
            }

            // The job may have finished while we slept
            if token.is_cancelled() {
                return RenewalOutcome::Cancelled;
            }

            match self
                .store
                .try_renew(self.job_id, &self.worker_id, Utc::now(), self.lease_duration)
                .await
            {
                Ok(true) => {
                    self.metrics.lease_renewed.inc();
                    debug!(job_id = %self.job_id, "Lease renewed");
                }
                Ok(false) => {
                    warn!(
                        job_id = %self.job_id,
                        worker_id = %self.worker_id,
                        "Lease lost during renewal"
                    );
                    return RenewalOutcome::Lost;
                }
                Err(e) => {
                    self.metrics.record_error(stage::RENEW);
                    error!(job_id = %self.job_id, "Lease renewal failed: {}", e);
                    return RenewalOutcome::Faulted;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewDispatch;
    use crate::persistence::InMemoryJobStore;

    async fn claimed_job(store: &InMemoryJobStore, worker: &str, lease: Duration) -> Uuid {
        let now = Utc::now();
        let job = store
            .create(NewDispatch::new("a@example.com", "a.pdf"), now)
            .await
            .unwrap();
        assert!(store.try_claim(job.id, worker, now, lease).await.unwrap());
        job.id
    }

    #[tokio::test]
    async fn test_monitor_renews_until_cancelled() {
        let store = Arc::new(InMemoryJobStore::new());
        let metrics = DispatchMetrics::new();
        let lease = Duration::from_millis(600);
        let id = claimed_job(&store, "me", lease).await;
        let before = store.get(id).await.unwrap().unwrap().lease_expiry.unwrap();

        let token = CancellationToken::new();
        let monitor = LeaseMonitor::new(
            store.clone(),
            metrics.clone(),
            id,
            "me".into(),
            lease,
            Duration::from_millis(50),
        );
        let handle = tokio::spawn(monitor.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(180)).await;
        token.cancel();

        assert_eq!(handle.await.unwrap(), RenewalOutcome::Cancelled);
        assert!(metrics.lease_renewed.get() >= 1.0);
        let after = store.get(id).await.unwrap().unwrap().lease_expiry.unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_monitor_reports_loss_to_foreign_owner() {
        let store = Arc::new(InMemoryJobStore::new());
        let metrics = DispatchMetrics::new();
        let id = claimed_job(&store, "someone-else", Duration::from_secs(30)).await;

        let monitor = LeaseMonitor::new(
            store.clone(),
            metrics.clone(),
            id,
            "me".into(),
            Duration::from_secs(30),
            Duration::from_millis(50),
        );
        let outcome = monitor.run(CancellationToken::new()).await;

        assert_eq!(outcome, RenewalOutcome::Lost);
        assert!(outcome.is_loss());
        assert_eq!(metrics.lease_renewed.get() as u64, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_tick_never_touches_store() {
        let store = Arc::new(InMemoryJobStore::new());
        let id = claimed_job(&store, "me", Duration::from_secs(30)).await;
        let before = store.get(id).await.unwrap().unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let monitor = LeaseMonitor::new(
            store.clone(),
            DispatchMetrics::new(),
            id,
            "me".into(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );

        assert_eq!(monitor.run(token).await, RenewalOutcome::Cancelled);
        assert_eq!(store.get(id).await.unwrap().unwrap(), before);
    }
}
