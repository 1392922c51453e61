use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics hooks for the admission engine. The engine increments and
/// observes; the export surface lives in the HTTP layer.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    decisions_total: CounterVec,
    rejections_total: CounterVec,
    store_errors_total: Counter,
    decision_duration: Histogram,
    policy_operations_total: CounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions_total = CounterVec::new(
            Opts::new(
                "quotagate_decisions_total",
                "Number of admission decisions evaluated",
            ),
            &["algorithm"],
        )?;

        let rejections_total = CounterVec::new(
            Opts::new(
                "quotagate_rejections_total",
                "Number of requests rejected, by reason",
            ),
            &["reason"],
        )?;

        let store_errors_total = Counter::new(
            "quotagate_store_errors_total",
            "Number of counter store failures absorbed by the failure policy",
        )?;

        let decision_duration = Histogram::with_opts(HistogramOpts::new(
            "quotagate_decision_duration_seconds",
            "Latency of admission decisions in seconds",
        ))?;

        let policy_operations_total = CounterVec::new(
            Opts::new(
                "quotagate_policy_operations_total",
                "Number of policy management operations, by kind",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(decisions_total.clone()))?;
        registry.register(Box::new(rejections_total.clone()))?;
        registry.register(Box::new(store_errors_total.clone()))?;
        registry.register(Box::new(decision_duration.clone()))?;
        registry.register(Box::new(policy_operations_total.clone()))?;

        Ok(Self {
            registry,
            decisions_total,
            rejections_total,
            store_errors_total,
            decision_duration,
            policy_operations_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_decision(&self, algorithm: &str) {
        self.decisions_total.with_label_values(&[algorithm]).inc();
    }

    pub fn record_rejection(&self, reason: &str) {
        self.rejections_total.with_label_values(&[reason]).inc();
    }

    pub fn record_store_error(&self) {
        self.store_errors_total.inc();
    }

    pub fn record_policy_operation(&self, operation: &str) {
        self.policy_operations_total
            .with_label_values(&[operation])
            .inc();
    }

    pub fn start_decision_timer(&self) -> prometheus::HistogramTimer {
        self.decision_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
