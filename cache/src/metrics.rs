use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for a [Cache](super::Cache).
#[derive(Default, Clone)]
pub struct Metrics {
    /// Number of successful refreshes (including the initial fetch)
    pub refreshes: Counter,
    /// Number of failed refreshes
    pub refresh_failures: Counter,
    /// Number of callers waiting on the in-flight refresh
    pub waiters: Gauge,
}

impl Metrics {
    /// Register the metrics with the given registry.
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "refreshes",
            "Number of successful refreshes",
            self.refreshes.clone(),
        );
        registry.register(
            "refresh_failures",
            "Number of failed refreshes",
            self.refresh_failures.clone(),
        );
        registry.register(
            "waiters",
            "Number of callers waiting on the in-flight refresh",
            self.waiters.clone(),
        );
    }
}
