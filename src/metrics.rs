use prometheus::{CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Final outcome of a proxied request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Allowed,
    RateLimited,
    MissingApiKey,
    InvalidRemoteAddress,
    StoreError,
    UpstreamError,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::RateLimited => "rate_limited",
            Outcome::MissingApiKey => "missing_api_key",
            Outcome::InvalidRemoteAddress => "invalid_remote_address",
            Outcome::StoreError => "store_error",
            Outcome::UpstreamError => "upstream_error",
        }
    }
}

/// Metrics collector for the proxy
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    requests: CounterVec,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: Histogram,

    request_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests = CounterVec::new(
            Opts::new(
                "ratelimit_proxy_requests_total",
                "Proxied requests by final outcome",
            ),
            &["outcome"],
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "ratelimit_proxy_store_operations_total",
                "Token bucket store operations by type and result",
            ),
            &["operation", "result"],
        )?;

        let store_operation_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_proxy_store_duration_seconds",
            "Duration of token bucket evaluations in seconds",
        ))?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_proxy_request_duration_seconds",
            "Duration of proxied requests in seconds, upstream time included",
        ))?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            requests,
            store_operations,
            store_operation_duration,
            request_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record the outcome of a request
    pub fn record_outcome(&self, outcome: Outcome) {
        self.requests.with_label_values(&[outcome.as_str()]).inc();
    }

    /// Number of requests recorded with `outcome`
    pub fn outcome_count(&self, outcome: Outcome) -> u64 {
        self.requests.with_label_values(&[outcome.as_str()]).get() as u64
    }

    /// Record a store operation
    pub fn record_store_operation(&self, operation: &str, result: &str) {
        self.store_operations.with_label_values(&[operation, result]).inc();
    }

    /// Record store operation duration
    pub fn record_store_duration(&self, duration_seconds: f64) {
        self.store_operation_duration.observe(duration_seconds);
    }

    /// Create a timer for measuring request duration
    pub fn start_request_timer(&self) -> prometheus::HistogramTimer {
        self.request_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_outcome(Outcome::Allowed);
        metrics.record_outcome(Outcome::RateLimited);
        metrics.record_store_operation("evaluate", "success");
        metrics.record_store_duration(0.002);

        let _timer = metrics.start_request_timer();
        assert_eq!(metrics.outcome_count(Outcome::Allowed), 1);
        assert_eq!(metrics.outcome_count(Outcome::StoreError), 0);
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();
        metrics.record_outcome(Outcome::RateLimited);

        let families = metrics.registry().gather();
        let requests = families
            .iter()
            .find(|f| f.get_name() == "ratelimit_proxy_requests_total")
            .expect("requests counter registered");
        let sample = &requests.get_metric()[0];
        assert_eq!(sample.get_label()[0].get_value(), "rate_limited");
        assert_eq!(sample.get_counter().get_value(), 1.0);
    }
}
