//! Prometheus metrics for the controller

use prometheus::{register_int_counter_vec, IntCounterVec};
use std::sync::OnceLock;

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    eviction_skipped_pod_too_young_total: IntCounterVec,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            eviction_skipped_pod_too_young_total: register_int_counter_vec!(
                "preoom_controller_eviction_skipped_pod_too_young_total",
                "Total number of evictions skipped because pod age was below minimum \
                 (possible misconfiguration or too-frequent restarts).",
                &["namespace", "pod"]
            )
            .expect("Failed to register eviction_skipped_pod_too_young_total"),
        }
    }
}

/// Lightweight handle to the global controller metrics.
///
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record an eviction skipped because the pod was younger than the
    /// configured minimum age.
    pub fn inc_eviction_skipped_pod_too_young(&self, namespace: &str, pod: &str) {
        self.inner()
            .eviction_skipped_pod_too_young_total
            .with_label_values(&[namespace, pod])
            .inc();
    }

    /// Current counter value for a label pair.
    pub fn eviction_skipped_pod_too_young(&self, namespace: &str, pod: &str) -> u64 {
        self.inner()
            .eviction_skipped_pod_too_young_total
            .with_label_values(&[namespace, pod])
            .get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_increments_per_label_pair() {
        let metrics = ControllerMetrics::new();

        assert_eq!(metrics.eviction_skipped_pod_too_young("obs", "a"), 0);
        metrics.inc_eviction_skipped_pod_too_young("obs", "a");
        metrics.inc_eviction_skipped_pod_too_young("obs", "a");
        metrics.inc_eviction_skipped_pod_too_young("obs", "b");

        assert_eq!(metrics.eviction_skipped_pod_too_young("obs", "a"), 2);
        assert_eq!(metrics.eviction_skipped_pod_too_young("obs", "b"), 1);
    }
}
