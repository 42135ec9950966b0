//! Prometheus instruments for the dispatch engine
//!
//! Each [`DispatchMetrics`] owns its registry, so tests and multiple engines in
//! one process never collide on metric names.

use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts,
    Registry, TextEncoder,
};

/// `result` label values for `dispatch_processed_total`
pub mod result {
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const REQUEUED: &str = "requeued";
    pub const LEASE_LOST: &str = "lease_lost";
}

/// `stage` label values for `dispatch_errors_total`
pub mod stage {
    pub const SCAN: &str = "scan";
    pub const PROCESS: &str = "process";
    pub const RENEW: &str = "renew";
    pub const RECLAIM: &str = "reclaim";
}

#[derive(Clone)]
pub struct DispatchMetrics {
    registry: Registry,

    /// Successful claims
    pub claimed: Counter,
    /// Job outcomes by result
    pub processed: CounterVec,
    /// Successful renewals
    pub lease_renewed: Counter,
    /// Store errors by stage
    pub errors: CounterVec,
    /// Jobs currently executing in this instance
    pub inflight: Gauge,
    /// Wall time of each processed job
    pub processing_duration: Histogram,
    /// Expired Processing leases returned to Pending
    pub reclaimed: Counter,
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let claimed = Counter::new("dispatch_claimed_total", "Jobs claimed by this instance")
            .expect("Failed to create claimed counter");
        registry
            .register(Box::new(claimed.clone()))
            .expect("Failed to register claimed counter");

        let processed = CounterVec::new(
            Opts::new("dispatch_processed_total", "Jobs processed by outcome"),
            &["result"],
        )
        .expect("Failed to create processed counter");
        registry
            .register(Box::new(processed.clone()))
            .expect("Failed to register processed counter");

        let lease_renewed = Counter::new("dispatch_lease_renewed_total", "Lease renewals")
            .expect("Failed to create lease renewed counter");
        registry
            .register(Box::new(lease_renewed.clone()))
            .expect("Failed to register lease renewed counter");

        let errors = CounterVec::new(
            Opts::new("dispatch_errors_total", "Dispatch errors by stage"),
            &["stage"],
        )
        .expect("Failed to create errors counter");
        registry
            .register(Box::new(errors.clone()))
            .expect("Failed to register errors counter");

        let inflight = Gauge::new("dispatch_inflight", "Jobs currently executing")
            .expect("Failed to create inflight gauge");
        registry
            .register(Box::new(inflight.clone()))
            .expect("Failed to register inflight gauge");

        let processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dispatch_processing_duration_seconds",
                "Job processing duration in seconds",
            )
            .buckets(
                exponential_buckets(0.25, 2.0, 10).expect("Failed to build duration buckets"),
            ),
        )
        .expect("Failed to create processing duration histogram");
        registry
            .register(Box::new(processing_duration.clone()))
            .expect("Failed to register processing duration histogram");

        let reclaimed = Counter::new(
            "dispatch_reclaimed_total",
            "Expired leases returned to pending",
        )
        .expect("Failed to create reclaimed counter");
        registry
            .register(Box::new(reclaimed.clone()))
            .expect("Failed to register reclaimed counter");

        Self {
            registry,
            claimed,
            processed,
            lease_renewed,
            errors,
            inflight,
            processing_duration,
            reclaimed,
        }
    }

    pub fn record_processed(&self, result: &str) {
        self.processed.with_label_values(&[result]).inc();
    }

    pub fn record_error(&self, stage: &str) {
        self.errors.with_label_values(&[stage]).inc();
    }

    pub fn processed_count(&self, result: &str) -> u64 {
        self.processed.with_label_values(&[result]).get() as u64
    }

    pub fn error_count(&self, stage: &str) -> u64 {
        self.errors.with_label_values(&[stage]).get() as u64
    }

    /// Text exposition of every instrument
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Holds the inflight gauge up for the lifetime of a job
pub(crate) struct InflightGuard {
    gauge: Gauge,
}

impl InflightGuard {
    pub(crate) fn new(metrics: &DispatchMetrics) -> Self {
        metrics.inflight.inc();
        Self {
            gauge: metrics.inflight.clone(),
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = DispatchMetrics::new();
        metrics.claimed.inc();
        metrics.record_processed(result::COMPLETED);
        metrics.record_error(stage::SCAN);
        metrics.processing_duration.observe(0.5);

        let encoded = metrics.encode().unwrap();
        assert!(encoded.contains("dispatch_claimed_total 1"));
        assert!(encoded.contains("dispatch_processed_total{result=\"completed\"} 1"));
        assert!(encoded.contains("dispatch_errors_total{stage=\"scan\"} 1"));
        assert!(encoded.contains("dispatch_processing_duration_seconds_bucket"));
    }

    #[test]
    fn test_separate_registries() {
        let a = DispatchMetrics::new();
        let b = DispatchMetrics::new();
        a.claimed.inc();
        assert_eq!(a.claimed.get() as u64, 1);
        assert_eq!(b.claimed.get() as u64, 0);
    }

    #[test]
    fn test_inflight_guard() {
        let metrics = DispatchMetrics::new();
        {
            let _first = InflightGuard::new(&metrics);
            let _second = InflightGuard::new(&metrics);
            assert_eq!(metrics.inflight.get() as i64, 2);
        }
        assert_eq!(metrics.inflight.get() as i64, 0);
    }
}
