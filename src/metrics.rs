use prometheus::{
    CounterVec, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector for the governance layer
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Admission metrics
    decisions: CounterVec,
    decision_duration: Histogram,

    // Cache metrics
    cache_operations: CounterVec,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,
    store_up: Gauge,

    // Invalidation worker metrics
    invalidation_jobs: CounterVec,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "governor_decisions_total",
                "Admission decisions by outcome",
            ),
            &["outcome"],
        )?;

        let decision_duration = Histogram::with_opts(HistogramOpts::new(
            "governor_decision_duration_seconds",
            "Duration of admission decisions in seconds",
        ))?;

        let cache_operations = CounterVec::new(
            Opts::new(
                "governor_cache_operations_total",
                "Cache operations by type and result",
            ),
            &["operation", "result"],
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "governor_store_operations_total",
                "Backing store commands by type and result",
            ),
            &["operation", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "governor_store_operation_duration_seconds",
                "Duration of backing store commands in seconds",
            ),
            &["operation"],
        )?;

        let store_up = Gauge::new(
            "governor_store_up",
            "Whether the last store health check succeeded (1) or failed (0)",
        )?;

        let invalidation_jobs = CounterVec::new(
            Opts::new(
                "governor_invalidation_jobs_total",
                "Background invalidation jobs by result",
            ),
            &["result"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;
        registry.register(Box::new(cache_operations.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(store_up.clone()))?;
        registry.register(Box::new(invalidation_jobs.clone()))?;

        Ok(Self {
            registry,
            decisions,
            decision_duration,
            cache_operations,
            store_operations,
            store_operation_duration,
            store_up,
            invalidation_jobs,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an admission outcome (`admitted`, `denied`, `fail_open`, `bypassed`)
    pub fn record_decision(&self, outcome: &str) {
        self.decisions.with_label_values(&[outcome]).inc();
    }

    /// Create a timer for measuring decision duration
    pub fn start_decision_timer(&self) -> prometheus::HistogramTimer {
        self.decision_duration.start_timer()
    }

    /// Record a cache operation (`hit`, `miss`, `error`, `ok`)
    pub fn record_cache_operation(&self, operation: &str, result: &str) {
        self.cache_operations
            .with_label_values(&[operation, result])
            .inc();
    }

    /// Record a store command
    pub fn record_store_operation(&self, operation: &str, result: &str) {
        self.store_operations
            .with_label_values(&[operation, result])
            .inc();
    }

    /// Record store command duration
    pub fn record_store_operation_duration(&self, operation: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    pub fn set_store_up(&self, up: bool) {
        self.store_up.set(if up { 1.0 } else { 0.0 });
    }

    pub fn record_invalidation_job(&self, result: &str) {
        self.invalidation_jobs.with_label_values(&[result]).inc();
    }

    /// Current count for a decision outcome
    pub fn decision_count(&self, outcome: &str) -> u64 {
        self.decisions.with_label_values(&[outcome]).get() as u64
    }

    /// Current count for a cache operation/result pair
    pub fn cache_operation_count(&self, operation: &str, result: &str) -> u64 {
        self.cache_operations
            .with_label_values(&[operation, result])
            .get() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_decision("admitted");
        metrics.record_decision("denied");
        metrics.record_cache_operation("get", "hit");
        metrics.record_store_operation("GET", "success");
        metrics.record_store_operation_duration("GET", 0.001);
        metrics.set_store_up(true);
        metrics.record_invalidation_job("completed");

        let _timer = metrics.start_decision_timer();

        assert_eq!(metrics.decision_count("admitted"), 1);
        assert_eq!(metrics.cache_operation_count("get", "hit"), 1);
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();

        metrics.record_decision("fail_open");

        let families = metrics.registry().gather();
        assert!(!families.is_empty());

        let found = families
            .iter()
            .any(|f| f.get_name() == "governor_decisions_total");
        assert!(found);
    }
}
