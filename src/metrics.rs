use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Outcome label of a limiter decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    Rejected,
    /// Store failed and the action was permitted
    FailOpen,
    /// Store failed and the action was refused
    FailClosed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Rejected => "rejected",
            Outcome::FailOpen => "fail_open",
            Outcome::FailClosed => "fail_closed",
        }
    }
}

/// Metrics collector for rate limiters
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    decisions: CounterVec,
    resets: CounterVec,
    store_errors: CounterVec,
    store_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "ratelimit_decisions_total",
                "Rate limit decisions by limiter, operation and outcome",
            ),
            &["limiter", "operation", "outcome"],
        )?;

        let resets = CounterVec::new(
            Opts::new("ratelimit_resets_total", "Windows cleared through reset"),
            &["limiter", "result"],
        )?;

        let store_errors = CounterVec::new(
            Opts::new(
                "ratelimit_store_errors_total",
                "Failed store calls by limiter and operation",
            ),
            &["limiter", "operation"],
        )?;

        let store_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_store_operation_duration_seconds",
                "Duration of store round trips in seconds",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(resets.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(store_duration.clone()))?;

        Ok(Self {
            registry,
            decisions,
            resets,
            store_errors,
            store_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_decision(&self, limiter: &str, operation: &str, outcome: Outcome) {
        self.decisions
            .with_label_values(&[limiter, operation, outcome.as_str()])
            .inc();
    }

    pub fn record_reset(&self, limiter: &str, ok: bool) {
        let result = if ok { "success" } else { "error" };
        self.resets.with_label_values(&[limiter, result]).inc();
    }

    pub fn record_store_error(&self, limiter: &str, operation: &str) {
        self.store_errors.with_label_values(&[limiter, operation]).inc();
    }

    pub fn record_store_duration(&self, operation: &str, duration_seconds: f64) {
        self.store_duration
            .with_label_values(&[operation])
            .observe(duration_seconds);
    }

    /// Current value of the decisions counter for one label set
    pub fn decision_count(&self, limiter: &str, operation: &str, outcome: Outcome) -> u64 {
        self.decisions
            .with_label_values(&[limiter, operation, outcome.as_str()])
            .get() as u64
    }

    pub fn store_error_count(&self, limiter: &str, operation: &str) -> u64 {
        self.store_errors
            .with_label_values(&[limiter, operation])
            .get() as u64
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
