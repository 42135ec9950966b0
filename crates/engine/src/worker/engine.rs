//! Dispatch engine: the poll loop and the stale lease reclaimer

use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::poller::JobPoller;
use super::pool::Dispatcher;
use super::processor::JobProcessor;
use super::resolver::{RandomVerdict, VerdictStrategy};
use crate::config::DispatchConfig;
use crate::metrics::{stage, DispatchMetrics};
use crate::persistence::JobStore;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    /// Not polling
    Stopped,
    /// Polling and dispatching
    Running,
    /// Shutdown signalled, waiting for in-flight jobs
    Draining,
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Engine already running
    #[error("dispatch engine is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// Engine task panicked
    #[error("dispatch engine task failed: {0}")]
    Join(String),
}

/// Lease-based dispatch engine
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use docdispatch_engine::prelude::*;
///
/// # async fn example() -> Result<(), EngineError> {
/// let store = Arc::new(InMemoryJobStore::new());
/// let engine = Arc::new(DispatchEngine::with_random_verdict(
///     store,
///     DispatchConfig::from_env(),
///     DispatchMetrics::new(),
/// ));
///
/// engine.spawn()?;
/// // ... later, graceful shutdown
/// engine.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct DispatchEngine {
    store: Arc<dyn JobStore>,
    config: DispatchConfig,
    metrics: DispatchMetrics,
    poller: JobPoller,
    dispatcher: Dispatcher,
    status: RwLock<EngineStatus>,
    shutdown: Mutex<CancellationToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchEngine {
    /// Create an engine; the configuration is normalized first
    pub fn new(
        store: Arc<dyn JobStore>,
        mut config: DispatchConfig,
        metrics: DispatchMetrics,
        verdict: Arc<dyn VerdictStrategy>,
    ) -> Self {
        config.normalize();

        let poller = JobPoller::new(Arc::clone(&store), metrics.clone(), &config);
        let processor = JobProcessor::new(Arc::clone(&store), metrics.clone(), &config, verdict);
        let dispatcher = Dispatcher::new(
            Arc::new(processor),
            metrics.clone(),
            config.max_concurrency,
        );

        Self {
            store,
            config,
            metrics,
            poller,
            dispatcher,
            status: RwLock::new(EngineStatus::Stopped),
            shutdown: Mutex::new(CancellationToken::new()),
            handle: Mutex::new(None),
        }
    }

    /// Create an engine with the simulated 80% pass-rate verdict
    pub fn with_random_verdict(
        store: Arc<dyn JobStore>,
        config: DispatchConfig,
        metrics: DispatchMetrics,
    ) -> Self {
        Self::new(store, config, metrics, Arc::new(RandomVerdict::default()))
    }

    /// Get current status
    pub fn status(&self) -> EngineStatus {
        *self.status.read()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Effective (normalized) configuration
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    /// Run the poll and reclaim loops until `token` is cancelled
    ///
    /// Returns after every in-flight job has stopped. Errors inside the loops
    /// are logged and counted; they never end the run.
    #[instrument(skip(self, token), fields(worker_id = %self.config.worker_id))]
    pub async fn run(&self, token: CancellationToken) -> Result<(), EngineError> {
        {
            let mut status = self.status.write();
            if *status != EngineStatus::Stopped {
                return Err(EngineError::AlreadyRunning);
            }
            *status = EngineStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            lease_ms = self.config.lease_duration.as_millis() as u64,
            renew_ms = self.config.renew_interval().as_millis() as u64,
            max_concurrency = self.config.max_concurrency,
            "Starting dispatch engine"
        );

        tokio::join!(self.poll_loop(&token), self.reclaim_loop(&token));

        *self.status.write() = EngineStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Dispatch engine stopped");
        Ok(())
    }

    /// Start the engine on the runtime
    ///
    /// May be called again after `shutdown()` has returned; each start gets a
    /// fresh shutdown token.
    pub fn spawn(self: &Arc<Self>) -> Result<(), EngineError> {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.status() != EngineStatus::Stopped {
            return Err(EngineError::AlreadyRunning);
        }

        let token = {
            let mut shutdown = self.shutdown.lock();
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
            shutdown.clone()
        };
        let engine = Arc::clone(self);
        *handle = Some(tokio::spawn(async move {
            if let Err(e) = engine.run(token).await {
                error!("Dispatch engine exited: {}", e);
            }
        }));
        Ok(())
    }

    /// Signal shutdown and wait for the spawned engine to drain
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        self.shutdown.lock().cancel();

        match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::Join(e.to_string())),
            Err(_) => {
                warn!("Shutdown timeout reached");
                Err(EngineError::ShutdownTimeout)
            }
        }
    }

    /// Poll, dispatch, wait; repeat until shutdown
    async fn poll_loop(&self, token: &CancellationToken) {
        loop {
            if token.is_cancelled() {
                break;
            }

            match self.poller.poll(self.dispatcher.available_slots()).await {
                Ok(claimed) if !claimed.is_empty() => {
                    let summary = self.dispatcher.dispatch(claimed, token).await;
                    if summary.faulted > 0 || summary.not_admitted > 0 {
                        warn!(
                            launched = summary.launched,
                            faulted = summary.faulted,
                            not_admitted = summary.not_admitted,
                            "Dispatch round left jobs unresolved"
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Poll failed: {}", e);
                }
            }

            if self.poller.wait(token).await {
                break;
            }
        }

        *self.status.write() = EngineStatus::Draining;
        debug!("Poll loop exited");
    }

    /// Return expired Processing leases to Pending on a fixed cadence
    async fn reclaim_loop(&self, token: &CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reclaim_interval());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.store.reclaim_expired(Utc::now()).await {
                        Ok(reclaimed) => {
                            if !reclaimed.is_empty() {
                                self.metrics.reclaimed.inc_by(reclaimed.len() as f64);
                                info!(count = reclaimed.len(), "Reclaimed expired leases");
                            }
                        }
                        Err(e) => {
                            self.metrics.record_error(stage::RECLAIM);
                            error!("Stale lease reclamation failed: {}", e);
                        }
                    }
                }
                _ = token.cancelled() => {
                    debug!("Reclaim loop: shutdown requested");
                    break;
                }
            }
        }

        debug!("Reclaim loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryJobStore;
    use std::time::Duration;

    fn engine() -> Arc<DispatchEngine> {
        let config = DispatchConfig::new()
            .with_worker_id("test-worker")
            .with_poll_interval(Duration::from_millis(50));
        Arc::new(DispatchEngine::with_random_verdict(
            Arc::new(InMemoryJobStore::new()),
            config,
            DispatchMetrics::new(),
        ))
    }

    #[test]
    fn test_engine_status() {
        assert_ne!(EngineStatus::Running, EngineStatus::Stopped);
        assert_ne!(EngineStatus::Draining, EngineStatus::Running);
    }

    #[test]
    fn test_new_normalizes_config() {
        let config = DispatchConfig {
            batch_size: 0,
            max_concurrency: 0,
            ..DispatchConfig::new()
        };
        let engine = DispatchEngine::with_random_verdict(
            Arc::new(InMemoryJobStore::new()),
            config,
            DispatchMetrics::new(),
        );
        assert_eq!(engine.config().batch_size, 1);
        assert_eq!(engine.config().max_concurrency, 1);
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let engine = engine();
        engine.spawn().unwrap();
        assert!(matches!(engine.spawn(), Err(EngineError::AlreadyRunning)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.status(), EngineStatus::Running);

        engine.shutdown().await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_respawn_after_shutdown_runs_again() {
        let engine = engine();
        engine.spawn().unwrap();
        engine.shutdown().await.unwrap();

        engine.spawn().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.status(), EngineStatus::Running);

        engine.shutdown().await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_without_spawn_is_noop() {
        let engine = engine();
        engine.shutdown().await.unwrap();
        assert_eq!(engine.status(), EngineStatus::Stopped);
    }
}
