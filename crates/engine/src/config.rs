//! Dispatch engine configuration
//!
//! All durations have safe defaults and clamped minimums so a bad value can
//! never produce a zero-delay busy loop or a lease that expires on arrival.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

/// Shortest poll interval accepted
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Shortest lease accepted
pub const MIN_LEASE_DURATION: Duration = Duration::from_millis(500);
/// Shortest renewal cadence accepted
pub const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(50);
/// Shortest work slice accepted
pub const MIN_WORK_SLICE: Duration = Duration::from_millis(10);
/// Shortest reclaim cadence accepted
pub const MIN_RECLAIM_INTERVAL: Duration = Duration::from_millis(50);

/// Dispatch engine configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use docdispatch_engine::DispatchConfig;
///
/// let config = DispatchConfig::default()
///     .with_worker_id("worker-a")
///     .with_lease_duration(Duration::from_secs(30))
///     .with_max_concurrency(8);
///
/// // Renewal defaults to a third of the lease
/// assert_eq!(config.renew_interval(), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchConfig {
    /// Identity written to `lock_owner`; unique per process instance
    pub worker_id: String,

    /// Delay between poll ticks
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Maximum candidates scanned per tick
    pub batch_size: usize,

    /// Lease granted by a claim or renewal
    #[serde(with = "duration_millis")]
    pub lease_duration: Duration,

    /// Renewal cadence; `None` means a third of the lease
    #[serde(default, with = "option_duration_millis")]
    pub renew_interval: Option<Duration>,

    /// Maximum concurrently executing jobs in this instance
    pub max_concurrency: usize,

    /// Total simulated work per job
    #[serde(with = "duration_millis")]
    pub work_duration: Duration,

    /// Granularity at which work observes lease loss
    #[serde(with = "duration_millis")]
    pub work_slice: Duration,

    /// Failed attempts after which a job is marked Failed
    pub max_attempts: u32,

    /// Stale lease reclamation cadence; `None` means the lease duration
    #[serde(default, with = "option_duration_millis")]
    pub reclaim_interval: Option<Duration>,

    /// How long `shutdown` waits for in-flight jobs
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval: Duration::from_secs(5),
            batch_size: 5,
            lease_duration: Duration::from_secs(30),
            renew_interval: None,
            max_concurrency: 5,
            work_duration: Duration::from_secs(2),
            work_slice: Duration::from_secs(1),
            max_attempts: 3,
            reclaim_interval: None,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatchConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DISPATCH_WORKER_ID`: Worker identity (default: `<host>:<uuid>`)
    /// - `DISPATCH_POLL_SECONDS`: Poll interval (default: 5)
    /// - `DISPATCH_BATCH_SIZE`: Candidates per tick (default: 5)
    /// - `DISPATCH_LEASE_SECONDS`: Lease duration (default: 30)
    /// - `DISPATCH_LEASE_RENEW_SECONDS`: Renewal cadence (default: lease / 3)
    /// - `DISPATCH_WORK_SECONDS`: Simulated work per job (default: 2)
    /// - `DISPATCH_MAX_CONCURRENCY`: Concurrent jobs (default: 5)
    /// - `DISPATCH_MAX_ATTEMPTS`: Attempts before Failed (default: 3)
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut config = Self {
            worker_id: std::env::var("DISPATCH_WORKER_ID")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.worker_id),
            poll_interval: env_parse::<u64>("DISPATCH_POLL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            batch_size: env_parse("DISPATCH_BATCH_SIZE").unwrap_or(defaults.batch_size),
            lease_duration: env_parse::<u64>("DISPATCH_LEASE_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_duration),
            renew_interval: env_parse::<u64>("DISPATCH_LEASE_RENEW_SECONDS")
                .map(Duration::from_secs),
            max_concurrency: env_parse("DISPATCH_MAX_CONCURRENCY")
                .unwrap_or(defaults.max_concurrency),
            work_duration: env_parse::<u64>("DISPATCH_WORK_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.work_duration),
            max_attempts: env_parse("DISPATCH_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            ..defaults
        };
        config.normalize();
        config
    }

    /// Set the worker identity
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Set the scan batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Set the lease duration
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease.max(MIN_LEASE_DURATION);
        self
    }

    /// Set an explicit renewal cadence
    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = Some(interval);
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the simulated work duration
    pub fn with_work_duration(mut self, work: Duration) -> Self {
        self.work_duration = work;
        self
    }

    /// Set the work slice
    pub fn with_work_slice(mut self, slice: Duration) -> Self {
        self.work_slice = slice.max(MIN_WORK_SLICE);
        self
    }

    /// Set the failed-attempt threshold
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set an explicit reclaim cadence
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = Some(interval);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Effective renewal cadence, clamped to `[MIN_RENEW_INTERVAL, lease / 2]`
    pub fn renew_interval(&self) -> Duration {
        let ceiling = (self.lease_duration / 2).max(MIN_RENEW_INTERVAL);
        self.renew_interval
            .unwrap_or(self.lease_duration / 3)
            .clamp(MIN_RENEW_INTERVAL, ceiling)
    }

    /// Effective reclaim cadence
    pub fn reclaim_interval(&self) -> Duration {
        self.reclaim_interval
            .unwrap_or(self.lease_duration)
            .max(MIN_RECLAIM_INTERVAL)
    }

    /// Clamp every field to its safe range
    ///
    /// Applied by the engine on construction, so fields set directly are
    /// held to the same minimums as the builder methods.
    pub fn normalize(&mut self) {
        if self.worker_id.trim().is_empty() {
            self.worker_id = default_worker_id();
        }
        self.poll_interval = self.poll_interval.max(MIN_POLL_INTERVAL);
        self.batch_size = self.batch_size.max(1);
        self.lease_duration = self.lease_duration.max(MIN_LEASE_DURATION);
        self.renew_interval = self.renew_interval.map(|_| self.renew_interval());
        self.max_concurrency = self.max_concurrency.max(1);
        self.work_slice = self.work_slice.max(MIN_WORK_SLICE);
        self.max_attempts = self.max_attempts.max(1);
        self.reclaim_interval = self.reclaim_interval.map(|_| self.reclaim_interval());
    }
}

/// `<host>:<uuid>` where host comes from `HOSTNAME`
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}:{}", host, Uuid::now_v7().simple())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
