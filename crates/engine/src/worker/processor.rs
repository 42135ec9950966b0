//! Job processor
//!
//! Runs one claimed job: re-reads it under ownership, performs the work in
//! slices raced against the job's [`LeaseMonitor`], and hands a surviving job
//! to the [`OutcomeResolver`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::lease::{LeaseMonitor, RenewalOutcome};
use super::resolver::{JobOutcome, OutcomeResolver, VerdictStrategy};
use crate::config::DispatchConfig;
use crate::metrics::{result, stage, DispatchMetrics, InflightGuard};
use crate::persistence::{JobStore, StoreError};

pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    metrics: DispatchMetrics,
    worker_id: String,
    lease_duration: Duration,
    renew_interval: Duration,
    work_duration: Duration,
    work_slice: Duration,
    verdict: Arc<dyn VerdictStrategy>,
    resolver: OutcomeResolver,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn JobStore>,
        metrics: DispatchMetrics,
        config: &DispatchConfig,
        verdict: Arc<dyn VerdictStrategy>,
    ) -> Self {
        let resolver = OutcomeResolver::new(
            Arc::clone(&store),
            metrics.clone(),
            config.worker_id.clone(),
            config.max_attempts,
        );

        Self {
            store,
            metrics,
            worker_id: config.worker_id.clone(),
            lease_duration: config.lease_duration,
            renew_interval: config.renew_interval(),
            work_duration: config.work_duration,
            work_slice: config.work_slice,
            verdict,
            resolver,
        }
    }

    /// Process one claimed job
    ///
    /// Never writes an outcome once `cancel` fires or the lease is lost.
    #[instrument(skip(self, cancel), fields(worker_id = %self.worker_id))]
    pub async fn process(
        &self,
        job_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, StoreError> {
        let _inflight = InflightGuard::new(&self.metrics);
        let started = Instant::now();

        let job = match self
            .store
            .read_owned(job_id, &self.worker_id, Utc::now())
            .await
        {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(%job_id, "Job no longer owned, skipping");
                self.metrics.record_processed(result::LEASE_LOST);
                return Ok(JobOutcome::LeaseLost);
            }
            Err(e) => {
                self.metrics.record_error(stage::PROCESS);
                return Err(e);
            }
        };

        debug!(
            %job_id,
            retry_count = job.retry_count,
            "Processing dispatch"
        );

        let monitor_token = cancel.child_token();
        let monitor = LeaseMonitor::new(
            Arc::clone(&self.store),
            self.metrics.clone(),
            job_id,
            self.worker_id.clone(),
            self.lease_duration,
            self.renew_interval,
        );
        let mut renewal = tokio::spawn(monitor.run(monitor_token.clone()));

        let mut remaining = self.work_duration;
        while !remaining.is_zero() {
            let step = remaining.min(self.work_slice);

            tokio::select! {
                biased;
                joined = &mut renewal => {
                    // The monitor only stops on its own when the lease is gone
                    // or the shared token fired
                    let outcome = self.monitor_outcome(job_id, joined);
                    if cancel.is_cancelled() {
                        return Ok(self.abandon(job_id));
                    }
                    debug_assert!(outcome.is_loss());
                    return Ok(self.lease_lost(job_id, started));
                }
                _ = cancel.cancelled() => {
                    monitor_token.cancel();
                    let _ = self.join_monitor(job_id, renewal).await;
                    return Ok(self.abandon(job_id));
                }
                _ = tokio::time::sleep(step) => {
                    remaining = remaining.saturating_sub(step);
                }
            }
        }

        // Decided while the monitor still renews; discarded below on loss
        let verdict = self.verdict.decide(&job);

        monitor_token.cancel();
        let renewal = self.join_monitor(job_id, renewal).await;

        if cancel.is_cancelled() {
            return Ok(self.abandon(job_id));
        }
        if renewal.is_loss() {
            return Ok(self.lease_lost(job_id, started));
        }

        let outcome = self.resolver.resolve(&job, &verdict).await;
        self.metrics
            .processing_duration
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    async fn join_monitor(
        &self,
        job_id: Uuid,
        handle: JoinHandle<RenewalOutcome>,
    ) -> RenewalOutcome {
        let joined = handle.await;
        self.monitor_outcome(job_id, joined)
    }

    fn monitor_outcome(
        &self,
        job_id: Uuid,
        joined: Result<RenewalOutcome, tokio::task::JoinError>,
    ) -> RenewalOutcome {
        match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.record_error(stage::RENEW);
                error!(%job_id, "Renewal monitor panicked: {}", e);
                RenewalOutcome::Faulted
            }
        }
    }

    fn lease_lost(&self, job_id: Uuid, started: Instant) -> JobOutcome {
        warn!(%job_id, "Aborting dispatch after lease loss");
        self.metrics.record_processed(result::LEASE_LOST);
        self.metrics
            .processing_duration
            .observe(started.elapsed().as_secs_f64());
        JobOutcome::LeaseLost
    }

    fn abandon(&self, job_id: Uuid) -> JobOutcome {
        debug!(%job_id, "Shutdown interrupted dispatch, leaving lease to expire");
        JobOutcome::Cancelled
    }
}
