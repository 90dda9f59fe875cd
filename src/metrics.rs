use crate::Error;
use prometheus::{opts, Histogram, HistogramOpts, IntCounter, IntCounterVec, Registry};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: Histogram,
    pub operations: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "sg_controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "sg_controller_reconciliation_errors_total",
                "reconciliation errors"
            ),
            &["instance", "error"],
        )
        .unwrap();
        let reconciliations =
            IntCounter::new("sg_controller_reconciliations_total", "reconciliations").unwrap();
        let operations = IntCounterVec::new(
            opts!(
                "sg_controller_applied_operations_total",
                "create, patch and delete calls issued by reconciliations"
            ),
            &["operation"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            operations,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.operations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, target_id: &str, e: &Error) {
        self.failures
            .with_label_values(&[target_id, e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_operations(&self, operation: &str, count: usize) {
        self.operations
            .with_label_values(&[operation])
            .inc_by(count as u64);
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}
