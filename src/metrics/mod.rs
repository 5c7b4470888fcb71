//! Prometheus metrics for selection and execution.
//!
//! One registry per service. Handles are cheap clones sharing the same
//! collectors, so the selector, proxy and loader each keep their own copy.

use crate::types::{Error, Result};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, HistogramVec,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Latency buckets in seconds; dense below 1s where the SLO thresholds sit.
const DURATION_BUCKETS: &[f64] = &[
    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 5.0, 10.0, 30.0,
];

/// `tool` label for calls naming a tool the catalog does not hold, so
/// caller input cannot mint new series.
pub const UNKNOWN_TOOL: &str = "unknown";

/// Outcome label of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::Timeout => "timeout",
            Outcome::Cancelled => "cancelled",
        }
    }

    /// Outcome for a failed request with the given error.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Timeout(_) => Outcome::Timeout,
            Error::Cancelled(_) => Outcome::Cancelled,
            _ => Outcome::Error,
        }
    }
}

/// Service metrics.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub request_errors_total: IntCounterVec,
    pub selections_total: IntCounterVec,
    pub executions_in_flight: IntGauge,
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
    pub catalog_generation: IntGauge,
    pub catalog_reloads_total: IntCounterVec,

    registry: Arc<Registry>,
}

impl std::fmt::Debug for ServiceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMetrics").finish_non_exhaustive()
    }
}

fn registration(err: prometheus::Error) -> Error {
    Error::internal(format!("metric registration failed: {}", err))
}

impl ServiceMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests_total = register_int_counter_vec_with_registry!(
            "ai_requests_total",
            "Total tool requests by tool and outcome",
            &["tool", "outcome"],
            registry
        )
        .map_err(registration)?;

        let request_duration_seconds = register_histogram_vec_with_registry!(
            "ai_request_duration_seconds",
            "Tool request duration in seconds",
            &["tool", "outcome"],
            DURATION_BUCKETS.to_vec(),
            registry
        )
        .map_err(registration)?;

        let request_errors_total = register_int_counter_vec_with_registry!(
            "ai_request_errors_total",
            "Failed tool requests by tool and error code",
            &["tool", "error"],
            registry
        )
        .map_err(registration)?;

        let selections_total = register_int_counter_vec_with_registry!(
            "ai_tool_selections_total",
            "Times a pattern was returned as the top search result",
            &["pattern"],
            registry
        )
        .map_err(registration)?;

        let executions_in_flight = register_int_gauge_with_registry!(
            "ai_tool_executions_in_flight",
            "Tool executions currently running",
            registry
        )
        .map_err(registration)?;

        let cache_hits_total = register_int_counter_with_registry!(
            "ai_tool_cache_hits_total",
            "Selector cache hits",
            registry
        )
        .map_err(registration)?;

        let cache_misses_total = register_int_counter_with_registry!(
            "ai_tool_cache_misses_total",
            "Selector cache misses",
            registry
        )
        .map_err(registration)?;

        let catalog_generation = register_int_gauge_with_registry!(
            "ai_tool_catalog_generation",
            "Generation of the catalog snapshot being served",
            registry
        )
        .map_err(registration)?;

        let catalog_reloads_total = register_int_counter_vec_with_registry!(
            "ai_tool_catalog_reloads_total",
            "Catalog reloads by result",
            &["result"],
            registry
        )
        .map_err(registration)?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            request_errors_total,
            selections_total,
            executions_in_flight,
            cache_hits_total,
            cache_misses_total,
            catalog_generation,
            catalog_reloads_total,
            registry: Arc::new(registry),
        })
    }

    /// Count one finished request.
    pub fn observe_request(&self, tool: &str, outcome: Outcome, elapsed: Duration) {
        let labels = [tool, outcome.as_str()];
        self.requests_total.with_label_values(&labels).inc();
        self.request_duration_seconds
            .with_label_values(&labels)
            .observe(elapsed.as_secs_f64());
    }

    pub fn observe_error(&self, tool: &str, code: &str) {
        self.request_errors_total
            .with_label_values(&[tool, code])
            .inc();
    }

    pub fn observe_reload(&self, ok: bool, generation: u64) {
        let result = if ok { "success" } else { "failure" };
        self.catalog_reloads_total.with_label_values(&[result]).inc();
        if ok {
            self.catalog_generation.set(generation as i64);
        }
    }

    /// Current value of `ai_requests_total{tool, outcome}`.
    pub fn requests(&self, tool: &str, outcome: Outcome) -> u64 {
        self.requests_total
            .with_label_values(&[tool, outcome.as_str()])
            .get()
    }

    /// Prometheus text exposition.
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| Error::internal(format!("metrics encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_counter_and_export() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.observe_request("echo", Outcome::Success, Duration::from_millis(3));
        metrics.observe_request("echo", Outcome::Success, Duration::from_millis(4));
        metrics.observe_error("disk_usage", "asset_not_found");

        assert_eq!(metrics.requests("echo", Outcome::Success), 2);
        let text = metrics.export().unwrap();
        assert!(text.contains(r#"ai_requests_total{outcome="success",tool="echo"} 2"#));
        assert!(text.contains(r#"ai_request_errors_total{error="asset_not_found",tool="disk_usage"} 1"#));
        assert!(text.contains("ai_request_duration_seconds_bucket"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ServiceMetrics::new().unwrap();
        let b = ServiceMetrics::new().unwrap();
        a.cache_hits_total.inc();
        assert_eq!(b.cache_hits_total.get(), 0);
    }

    #[test]
    fn test_reload_sets_generation() {
        let metrics = ServiceMetrics::new().unwrap();
        metrics.observe_reload(true, 7);
        metrics.observe_reload(false, 99);
        assert_eq!(metrics.catalog_generation.get(), 7);
        assert_eq!(
            metrics.catalog_reloads_total.with_label_values(&["failure"]).get(),
            1
        );
    }

    #[test]
    fn test_outcome_from_error() {
        assert_eq!(Outcome::from_error(&Error::timeout("x")), Outcome::Timeout);
        assert_eq!(Outcome::from_error(&Error::cancelled("x")), Outcome::Cancelled);
        assert_eq!(Outcome::from_error(&Error::asset_not_found("x")), Outcome::Error);
    }
}
