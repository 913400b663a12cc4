use std::sync::Arc;

use anyhow::Result;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Counters updated by [`crate::GlobalLock`].
#[derive(Debug)]
pub struct LockMetrics {
    pub acquisitions: Counter,
    /// Conditional writes that found the key already held.
    pub contended_attempts: Counter,
    pub timeouts: Counter,
    pub extensions: Counter,
    pub releases: Counter,
    /// Extend / release calls made without a matching lease.
    pub ownership_mismatches: Counter,
    pub store_errors: Counter,
    pub acquire_wait_seconds: Histogram,
}

impl LockMetrics {
    /// Create a new [`LockMetrics`] instance and register every metric with
    /// the supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let acquisitions = Counter::default();
        registry.register(
            "globallock_acquisitions",
            "Leases acquired",
            acquisitions.clone(),
        );

        let contended_attempts = Counter::default();
        registry.register(
            "globallock_contended_attempts",
            "Acquire attempts that found the lock already held",
            contended_attempts.clone(),
        );

        let timeouts = Counter::default();
        registry.register(
            "globallock_timeouts",
            "Blocking acquires abandoned at the wait timeout",
            timeouts.clone(),
        );

        let extensions = Counter::default();
        registry.register(
            "globallock_extensions",
            "Lease TTL extensions",
            extensions.clone(),
        );

        let releases = Counter::default();
        registry.register("globallock_releases", "Leases released", releases.clone());

        let ownership_mismatches = Counter::default();
        registry.register(
            "globallock_ownership_mismatches",
            "Extend or release calls skipped because the caller did not own the lease",
            ownership_mismatches.clone(),
        );

        let store_errors = Counter::default();
        registry.register(
            "globallock_store_errors",
            "Lock store communication failures",
            store_errors.clone(),
        );

        let acquire_wait_seconds = Histogram::new(exponential_buckets(0.001, 2.0, 16));
        registry.register(
            "globallock_acquire_wait_seconds",
            "Time spent in a blocking acquire before the lease was granted",
            acquire_wait_seconds.clone(),
        );

        Self {
            acquisitions,
            contended_attempts,
            timeouts,
            extensions,
            releases,
            ownership_mismatches,
            store_errors,
            acquire_wait_seconds,
        }
    }

    /// Metrics that are updated but not exported anywhere.
    pub fn unregistered() -> Self {
        Self::new(&mut Registry::default())
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Registry plus the lock metrics registered in it.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<LockMetrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = LockMetrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the OpenMetrics text exposition.
    pub fn encode(&self) -> Result<String> {
        let mut out = String::new();
        encode(&mut out, &self.registry)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_output_lists_lock_counters() {
        let registry = MetricsRegistry::new();
        registry.metrics.acquisitions.inc();
        registry.metrics.acquisitions.inc();
        registry.metrics.store_errors.inc();

        let text = registry.encode().unwrap();
        assert!(text.contains("globallock_acquisitions_total 2"));
        assert!(text.contains("globallock_store_errors_total 1"));
        assert!(text.contains("globallock_acquire_wait_seconds_bucket"));
    }
}
