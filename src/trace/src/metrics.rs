use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};

use crate::error::TraceableError;

#[derive(Debug, Clone)]
pub struct Metrics {
    pub allocations: IntCounterVec,
    pub reconciliations: IntCounter,
    pub reconcile_failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub orphaned_ips_cleaned: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        let allocations = IntCounterVec::new(
            opts!(
                "rosterd_ip_allocations_total",
                "Total count of IP allocation and release operations",
            ),
            &["mode"],
        )
        .unwrap();
        let reconciliations = IntCounter::new(
            "rosterd_reconciliation_total",
            "Total count of reconciler sweeps",
        )
        .unwrap();
        let reconcile_failures = IntCounterVec::new(
            opts!(
                "rosterd_reconciliation_errors_total",
                "Reconciliation errors by pool",
            ),
            &["pool", "error"],
        )
        .unwrap();
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "rosterd_reconcile_duration_seconds",
                "The duration of a reconciler sweep in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &[],
        )
        .unwrap();
        let orphaned_ips_cleaned = IntCounter::new(
            "rosterd_orphaned_ips_cleaned_total",
            "Total count of orphaned reservations removed",
        )
        .unwrap();
        Metrics {
            allocations,
            reconciliations,
            reconcile_failures,
            reconcile_duration,
            orphaned_ips_cleaned,
        }
    }
}

impl Metrics {
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.allocations.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.reconcile_failures.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.orphaned_ips_cleaned.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<E: TraceableError>(&self, pool: &str, error: &E) {
        self.reconcile_failures
            .with_label_values(&[pool, &error.metric_label()])
            .inc()
    }
}
