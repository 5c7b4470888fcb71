//! Release gate.
//!
//! Polls a metrics source for a fixed window. Every sample above the error
//! rate or latency thresholds is a violation; once violations exceed the
//! budget the gate fails immediately, otherwise it passes when the window
//! closes.

mod sources;

pub use sources::{histogram_quantile, PrometheusSource, ScrapeSource};

use crate::types::{GateConfig, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

/// Error rate and tail latency observed over one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GateSample {
    pub requests: f64,
    pub error_rate: f64,
    #[serde(with = "humantime_serde")]
    pub p95: Duration,
    #[serde(with = "humantime_serde")]
    pub p99: Duration,
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn sample(&self) -> Result<GateSample>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GateVerdict {
    pub passed: bool,
    pub samples: u32,
    pub violations: u32,
    /// One line per violating sample.
    pub reasons: Vec<String>,
}

pub struct SloGate {
    source: Arc<dyn MetricsSource>,
    config: GateConfig,
}

impl std::fmt::Debug for SloGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SloGate")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SloGate {
    pub fn new(source: Arc<dyn MetricsSource>, config: GateConfig) -> Self {
        Self { source, config }
    }

    /// Threshold breaches in `sample`, empty when healthy.
    pub fn check(&self, sample: &GateSample) -> Vec<String> {
        let mut breaches = Vec::new();
        if sample.error_rate >= self.config.max_error_rate {
            breaches.push(format!(
                "error rate {:.2}% >= {:.2}%",
                sample.error_rate * 100.0,
                self.config.max_error_rate * 100.0
            ));
        }
        if sample.p95 >= self.config.max_p95 {
            breaches.push(format!(
                "p95 {}ms >= {}ms",
                sample.p95.as_millis(),
                self.config.max_p95.as_millis()
            ));
        }
        if sample.p99 >= self.config.max_p99 {
            breaches.push(format!(
                "p99 {}ms >= {}ms",
                sample.p99.as_millis(),
                self.config.max_p99.as_millis()
            ));
        }
        breaches
    }

    /// Poll until the window closes or the violation budget is exhausted.
    ///
    /// A sample that cannot be taken counts as a violation.
    pub async fn run(&self) -> Result<GateVerdict> {
        let deadline = Instant::now() + self.config.window;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut verdict = GateVerdict::default();

        loop {
            ticker.tick().await;
            verdict.samples += 1;

            let breaches = match self.source.sample().await {
                Ok(sample) => {
                    tracing::debug!(
                        requests = sample.requests,
                        error_rate = sample.error_rate,
                        p95_ms = sample.p95.as_millis() as u64,
                        p99_ms = sample.p99.as_millis() as u64,
                        "gate sample"
                    );
                    self.check(&sample)
                }
                Err(err) => vec![format!("metrics unavailable: {}", err)],
            };

            if !breaches.is_empty() {
                verdict.violations += 1;
                let reason = breaches.join(", ");
                tracing::warn!(
                    violations = verdict.violations,
                    budget = self.config.violation_budget,
                    reason = %reason,
                    "gate violation"
                );
                verdict.reasons.push(reason);
                if verdict.violations > self.config.violation_budget {
                    tracing::error!(samples = verdict.samples, "gate failed");
                    return Ok(verdict);
                }
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        verdict.passed = true;
        tracing::info!(
            samples = verdict.samples,
            violations = verdict.violations,
            "gate passed"
        );
        Ok(verdict)
    }
}
