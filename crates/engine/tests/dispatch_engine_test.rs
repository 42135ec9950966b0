//! End-to-end dispatch scenarios over the in-memory store
//!
//! Run with: cargo test -p docdispatch-engine --test dispatch_engine_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docdispatch_engine::metrics::result;
use docdispatch_engine::metrics::stage;
use docdispatch_engine::prelude::*;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// =============================================================================
// Test store
// =============================================================================

/// In-memory store with injectable faults and a resolve ledger
#[derive(Default)]
struct TestStore {
    inner: InMemoryJobStore,
    renewals_fail: AtomicBool,
    scan_failures: AtomicUsize,
    resolved: Mutex<HashMap<Uuid, Vec<String>>>,
}

impl TestStore {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn successful_resolves(&self, id: Uuid) -> Vec<String> {
        self.resolved
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl JobStore for TestStore {
    async fn scan_claimable(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, StoreError> {
        let fail = self
            .scan_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StoreError::Database("connection refused".into()));
        }
        self.inner.scan_claimable(limit, now).await
    }

    async fn try_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        self.inner.try_claim(id, worker_id, now, lease).await
    }

    async fn try_renew(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        if self.renewals_fail.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.try_renew(id, worker_id, now, lease).await
    }

    async fn read_owned(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        self.inner.read_owned(id, worker_id, now).await
    }

    async fn resolve(
        &self,
        id: Uuid,
        worker_id: &str,
        resolution: &JobResolution,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let applied = self.inner.resolve(id, worker_id, resolution, now).await?;
        if applied {
            self.resolved
                .lock()
                .unwrap()
                .entry(id)
                .or_default()
                .push(worker_id.to_string());
        }
        Ok(applied)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        self.inner.reclaim_expired(now).await
    }

    async fn create(&self, new: NewDispatch, now: DateTime<Utc>) -> Result<DispatchJob, StoreError> {
        self.inner.create(new, now).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<DispatchJob>, StoreError> {
        self.inner.get(id).await
    }

    async fn list(&self, page: Pagination) -> Result<Vec<DispatchJob>, StoreError> {
        self.inner.list(page).await
    }

    async fn force_requeue(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        self.inner.force_requeue(id, now).await
    }

    async fn release_lock(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        self.inner.release_lock(id, now).await
    }

    async fn clear_error(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        self.inner.clear_error(id, now).await
    }

    async fn reset_retries(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchJob>, StoreError> {
        self.inner.reset_retries(id, now).await
    }

    async fn snapshot(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<StatusSnapshot, StoreError> {
        self.inner.snapshot(now, stale_before).await
    }

    async fn recent(
        &self,
        take: u32,
        include_completed: bool,
    ) -> Result<Vec<DispatchJob>, StoreError> {
        self.inner.recent(take, include_completed).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn fast_config(worker_id: &str) -> DispatchConfig {
    DispatchConfig::new()
        .with_worker_id(worker_id)
        .with_poll_interval(Duration::from_millis(50))
        .with_lease_duration(Duration::from_secs(2))
        .with_work_duration(Duration::from_millis(40))
        .with_work_slice(Duration::from_millis(10))
        .with_reclaim_interval(Duration::from_secs(60))
}

fn always_pass() -> Arc<dyn VerdictStrategy> {
    Arc::new(|_: &DispatchJob| Verdict::Pass)
}

fn always_fail() -> Arc<dyn VerdictStrategy> {
    Arc::new(|_: &DispatchJob| Verdict::Fail("mailbox unavailable".into()))
}

struct Running {
    engine: Arc<DispatchEngine>,
    token: CancellationToken,
    handle: JoinHandle<Result<(), EngineError>>,
}

impl Running {
    async fn stop(self) -> Arc<DispatchEngine> {
        self.token.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("engine did not stop")
            .unwrap()
            .unwrap();
        self.engine
    }
}

fn start(
    store: Arc<dyn JobStore>,
    config: DispatchConfig,
    metrics: DispatchMetrics,
    verdict: Arc<dyn VerdictStrategy>,
) -> Running {
    let engine = Arc::new(DispatchEngine::new(store, config, metrics, verdict));
    let token = CancellationToken::new();
    let handle = {
        let engine = Arc::clone(&engine);
        let token = token.clone();
        tokio::spawn(async move { engine.run(token).await })
    };
    Running {
        engine,
        token,
        handle,
    }
}

async fn create_job(store: &dyn JobStore, name: &str) -> DispatchJob {
    store
        .create(NewDispatch::new("user@example.com", name), Utc::now())
        .await
        .unwrap()
}

async fn wait_for_status(store: &dyn JobStore, id: Uuid, status: JobStatus) -> DispatchJob {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let job = store.get(id).await.unwrap().unwrap();
        if job.status == status {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {:?}, expected {:?}",
            id,
            job.status,
            status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test_log::test(tokio::test)]
async fn test_happy_path_completes_and_clears_lease() {
    let store = TestStore::new();
    let metrics = DispatchMetrics::new();
    let job = create_job(store.as_ref(), "invoice.pdf").await;

    let running = start(
        store.clone(),
        fast_config("worker-a"),
        metrics.clone(),
        always_pass(),
    );
    let done = wait_for_status(store.as_ref(), job.id, JobStatus::Completed).await;
    running.stop().await;

    assert_eq!(done.retry_count, 0);
    assert!(done.lock_owner.is_none());
    assert!(done.lease_expiry.is_none());
    assert!(done.last_error.is_none());
    assert_eq!(metrics.claimed.get() as u64, 1);
    assert_eq!(metrics.processed_count(result::COMPLETED), 1);
    assert_eq!(metrics.inflight.get() as i64, 0);
    assert_eq!(store.successful_resolves(job.id), vec!["worker-a".to_string()]);
}

#[test_log::test(tokio::test)]
async fn test_transient_failures_then_success() {
    let store = TestStore::new();
    let metrics = DispatchMetrics::new();
    let job = create_job(store.as_ref(), "contract.pdf").await;

    // Fail the first two attempts, pass the third
    let verdict: Arc<dyn VerdictStrategy> = Arc::new(|job: &DispatchJob| {
        if job.retry_count < 2 {
            Verdict::Fail("smtp timeout".into())
        } else {
            Verdict::Pass
        }
    });

    let running = start(store.clone(), fast_config("worker-a"), metrics.clone(), verdict);
    let done = wait_for_status(store.as_ref(), job.id, JobStatus::Completed).await;
    running.stop().await;

    assert_eq!(done.retry_count, 2);
    assert!(done.last_error.is_none());
    assert!(done.lock_owner.is_none());
    assert_eq!(metrics.claimed.get() as u64, 3);
    assert_eq!(metrics.processed_count(result::REQUEUED), 2);
    assert_eq!(metrics.processed_count(result::COMPLETED), 1);
}

#[test_log::test(tokio::test)]
async fn test_exhausted_retries_end_failed() {
    let store = TestStore::new();
    let metrics = DispatchMetrics::new();
    let job = create_job(store.as_ref(), "statement.pdf").await;

    let running = start(
        store.clone(),
        fast_config("worker-a"),
        metrics.clone(),
        always_fail(),
    );
    let done = wait_for_status(store.as_ref(), job.id, JobStatus::Failed).await;

    // Give the engine a few more ticks to prove it never picks the job up again
    tokio::time::sleep(Duration::from_millis(200)).await;
    running.stop().await;

    assert_eq!(done.retry_count, 3);
    assert!(done.last_error.as_deref().unwrap().contains("mailbox unavailable"));
    assert!(done.lock_owner.is_none());
    assert!(done.lease_expiry.is_none());
    assert_eq!(metrics.claimed.get() as u64, 3);
    assert_eq!(metrics.processed_count(result::REQUEUED), 2);
    assert_eq!(metrics.processed_count(result::FAILED), 1);
    assert!(store
        .scan_claimable(10, Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap()
        .is_empty());
    assert_eq!(store.get(job.id).await.unwrap().unwrap(), done);
}

#[test_log::test(tokio::test)]
async fn test_lease_loss_mid_work_aborts_without_outcome() {
    let store = TestStore::new();
    store.renewals_fail.store(true, Ordering::SeqCst);
    let metrics = DispatchMetrics::new();
    let job = create_job(store.as_ref(), "payslip.pdf").await;

    let config = fast_config("worker-a")
        .with_lease_duration(Duration::from_secs(1))
        .with_renew_interval(Duration::from_millis(50))
        .with_work_duration(Duration::from_secs(2))
        .with_work_slice(Duration::from_millis(20));

    let running = start(store.clone(), config, metrics.clone(), always_pass());
    wait_until(|| metrics.processed_count(result::LEASE_LOST) >= 1).await;
    running.stop().await;

    // Left exactly as the failed renewal found it
    let stale = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stale.status, JobStatus::Processing);
    assert_eq!(stale.lock_owner.as_deref(), Some("worker-a"));
    assert_eq!(stale.retry_count, 0);
    assert!(store.successful_resolves(job.id).is_empty());
    assert_eq!(metrics.processed_count(result::COMPLETED), 0);

    // Not reclaimable before the lease lapses, reclaimable after
    assert!(store.reclaim_expired(Utc::now()).await.unwrap().is_empty());
    let after_expiry = stale.lease_expiry.unwrap() + chrono::Duration::milliseconds(1);
    let reclaimed = store.reclaim_expired(after_expiry).await.unwrap();
    assert_eq!(reclaimed, vec![job.id]);

    let requeued = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert!(requeued.lock_owner.is_none());
    assert_eq!(requeued.retry_count, 0);
    assert!(requeued.is_claimable(after_expiry));
}

#[test_log::test(tokio::test)]
async fn test_concurrency_cap_is_never_exceeded() {
    let store = TestStore::new();
    let metrics = DispatchMetrics::new();
    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(create_job(store.as_ref(), &format!("{i}.pdf")).await.id);
    }

    let config = fast_config("worker-a")
        .with_batch_size(8)
        .with_max_concurrency(3)
        .with_work_duration(Duration::from_millis(120))
        .with_work_slice(Duration::from_millis(20));

    let peak = Arc::new(AtomicUsize::new(0));
    let sampling = CancellationToken::new();
    let sampler = {
        let metrics = metrics.clone();
        let peak = Arc::clone(&peak);
        let sampling = sampling.clone();
        tokio::spawn(async move {
            while !sampling.is_cancelled() {
                let inflight = metrics.inflight.get() as usize;
                peak.fetch_max(inflight, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let running = start(store.clone(), config, metrics.clone(), always_pass());
    for id in &ids {
        wait_for_status(store.as_ref(), *id, JobStatus::Completed).await;
    }
    running.stop().await;
    sampling.cancel();
    sampler.await.unwrap();

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak in-flight {} exceeded cap", peak);
    assert!(peak >= 1);
    assert_eq!(metrics.processed_count(result::COMPLETED), 8);
}

#[test_log::test(tokio::test)]
async fn test_saturated_pool_does_not_strand_claimed_jobs() {
    let store = TestStore::new();
    let metrics = DispatchMetrics::new();
    let mut ids = Vec::new();
    for i in 0..4 {
        ids.push(create_job(store.as_ref(), &format!("{i}.pdf")).await.id);
    }

    // Four jobs back to back take longer than one lease
    let config = fast_config("worker-a")
        .with_batch_size(4)
        .with_max_concurrency(1)
        .with_lease_duration(Duration::from_millis(500))
        .with_work_duration(Duration::from_millis(300))
        .with_work_slice(Duration::from_millis(20));

    let running = start(store.clone(), config, metrics.clone(), always_pass());
    for id in &ids {
        wait_for_status(store.as_ref(), *id, JobStatus::Completed).await;
    }
    running.stop().await;

    assert_eq!(metrics.processed_count(result::LEASE_LOST), 0);
    assert_eq!(metrics.processed_count(result::COMPLETED), 4);
    assert_eq!(metrics.claimed.get() as u64, 4);
    for id in &ids {
        assert_eq!(store.successful_resolves(*id), vec!["worker-a".to_string()]);
    }
}

#[test_log::test(tokio::test)]
async fn test_competing_engines_resolve_each_job_once() {
    let store = TestStore::new();
    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(create_job(store.as_ref(), &format!("{i}.pdf")).await.id);
    }

    let metrics_a = DispatchMetrics::new();
    let metrics_b = DispatchMetrics::new();
    let a = start(
        store.clone(),
        fast_config("worker-a").with_batch_size(4),
        metrics_a.clone(),
        always_pass(),
    );
    let b = start(
        store.clone(),
        fast_config("worker-b").with_batch_size(4),
        metrics_b.clone(),
        always_pass(),
    );

    for id in &ids {
        wait_for_status(store.as_ref(), *id, JobStatus::Completed).await;
    }
    a.stop().await;
    b.stop().await;

    for id in &ids {
        assert_eq!(store.successful_resolves(*id).len(), 1, "job {} resolved twice", id);
    }
    assert_eq!(
        metrics_a.claimed.get() as u64 + metrics_b.claimed.get() as u64,
        20
    );
}

#[test_log::test(tokio::test)]
async fn test_poll_loop_survives_store_errors() {
    let store = TestStore::new();
    store.scan_failures.store(3, Ordering::SeqCst);
    let metrics = DispatchMetrics::new();
    let job = create_job(store.as_ref(), "retry.pdf").await;

    let running = start(
        store.clone(),
        fast_config("worker-a"),
        metrics.clone(),
        always_pass(),
    );
    wait_for_status(store.as_ref(), job.id, JobStatus::Completed).await;
    running.stop().await;

    assert_eq!(metrics.error_count(stage::SCAN), 3);
    assert_eq!(metrics.processed_count(result::COMPLETED), 1);
}

#[test_log::test(tokio::test)]
async fn test_shutdown_leaves_lease_to_expire() {
    let store = TestStore::new();
    let metrics = DispatchMetrics::new();
    let job = create_job(store.as_ref(), "slow.pdf").await;

    let config = fast_config("worker-a")
        .with_work_duration(Duration::from_secs(30))
        .with_work_slice(Duration::from_millis(20));

    let running = start(store.clone(), config, metrics.clone(), always_pass());
    wait_until(|| metrics.inflight.get() as i64 == 1).await;

    let engine = running.stop().await;
    assert_eq!(engine.status(), EngineStatus::Stopped);

    let job = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.lock_owner.as_deref(), Some("worker-a"));
    assert_eq!(job.retry_count, 0);
    assert!(store.successful_resolves(job.id).is_empty());
    assert_eq!(metrics.inflight.get() as i64, 0);
    assert_eq!(metrics.processed_count(result::COMPLETED), 0);
    assert_eq!(metrics.processed_count(result::LEASE_LOST), 0);
}

#[test_log::test(tokio::test)]
async fn test_reclaim_loop_returns_abandoned_job() {
    let store = TestStore::new();
    let metrics = DispatchMetrics::new();
    let job = create_job(store.as_ref(), "orphan.pdf").await;

    // A crashed worker left a lease that already expired
    let past = Utc::now() - chrono::Duration::seconds(10);
    assert!(store
        .try_claim(job.id, "crashed-worker", past, Duration::from_secs(1))
        .await
        .unwrap());

    let config = fast_config("worker-a").with_reclaim_interval(Duration::from_millis(50));
    let running = start(store.clone(), config, metrics.clone(), always_pass());
    let done = wait_for_status(store.as_ref(), job.id, JobStatus::Completed).await;
    running.stop().await;

    assert_eq!(done.retry_count, 0);
    assert!(metrics.reclaimed.get() as u64 >= 1);
    assert_eq!(store.successful_resolves(job.id), vec!["worker-a".to_string()]);
}
