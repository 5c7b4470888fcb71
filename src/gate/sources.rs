//! Metrics backends for the release gate.

use super::{GateSample, MetricsSource};
use crate::types::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

const REQUESTS: &str = "ai_requests_total";
const DURATION_BUCKET: &str = "ai_request_duration_seconds_bucket";

fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::internal(format!("metrics client: {}", e)))
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// Quantile `q` from cumulative `(upper_bound, count)` buckets sorted by
/// bound, interpolating linearly inside the matching bucket.
pub fn histogram_quantile(q: f64, buckets: &[(f64, f64)]) -> f64 {
    let total = buckets.last().map_or(0.0, |b| b.1);
    if total <= 0.0 {
        return 0.0;
    }
    let rank = q * total;
    let (mut prev_le, mut prev_count) = (0.0, 0.0);
    for &(le, count) in buckets {
        if count >= rank {
            if le.is_infinite() {
                return prev_le;
            }
            let in_bucket = count - prev_count;
            if in_bucket <= 0.0 {
                return le;
            }
            return prev_le + (le - prev_le) * (rank - prev_count) / in_bucket;
        }
        prev_le = le;
        prev_count = count;
    }
    prev_le
}

// =============================================================================
// Prometheus HTTP API
// =============================================================================

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    /// `[timestamp, "value"]`
    value: (f64, String),
}

/// Instant queries against `GET {base}/api/v1/query`.
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    client: reqwest::Client,
    base_url: String,
    range: String,
}

impl PrometheusSource {
    /// `range` is the rate window used in every query.
    pub fn new(base_url: impl Into<String>, range: Duration, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            range: format!("{}s", range.as_secs().max(1)),
        })
    }

    async fn query(&self, expr: &str) -> Result<f64> {
        let response = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", expr)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::upstream(format!("prometheus returned {}", status)));
        }
        let body: QueryResponse = response.json().await?;
        if body.status != "success" {
            return Err(Error::upstream(format!(
                "prometheus query failed: {}",
                body.error.unwrap_or_default()
            )));
        }
        let value = body
            .data
            .and_then(|d| d.result.into_iter().next())
            .map(|s| s.value.1.parse::<f64>().unwrap_or(0.0))
            .unwrap_or(0.0);
        // NaN comes back when there was no traffic in the range.
        Ok(if value.is_nan() { 0.0 } else { value })
    }

    fn quantile_expr(&self, q: f64) -> String {
        format!(
            "histogram_quantile({}, sum by (le) (rate({}[{}])))",
            q, DURATION_BUCKET, self.range
        )
    }
}

#[async_trait]
impl MetricsSource for PrometheusSource {
    async fn sample(&self) -> Result<GateSample> {
        let requests_expr = format!("sum(rate({}[{}]))", REQUESTS, self.range);
        let errors_expr = format!(
            "sum(rate({}{{outcome!=\"success\"}}[{}]))",
            REQUESTS, self.range
        );
        let p95_expr = self.quantile_expr(0.95);
        let p99_expr = self.quantile_expr(0.99);
        let (requests, errors, p95, p99) = futures::try_join!(
            self.query(&requests_expr),
            self.query(&errors_expr),
            self.query(&p95_expr),
            self.query(&p99_expr)
        )?;
        Ok(GateSample {
            requests,
            error_rate: if requests > 0.0 { errors / requests } else { 0.0 },
            p95: seconds(p95),
            p99: seconds(p99),
        })
    }
}

// =============================================================================
// Direct scrape
// =============================================================================

/// Counter totals from one scrape, summed over every tool label.
#[derive(Debug, Clone, Default, PartialEq)]
struct Totals {
    requests: f64,
    errors: f64,
    /// `le` label text to cumulative count.
    buckets: HashMap<String, f64>,
}

impl Totals {
    fn parse(text: &str) -> Self {
        let mut totals = Totals::default();
        for line in text.lines() {
            let Some((name, labels, value)) = parse_line(line) else {
                continue;
            };
            match name {
                REQUESTS => {
                    totals.requests += value;
                    if label(&labels, "outcome") != Some("success") {
                        totals.errors += value;
                    }
                }
                DURATION_BUCKET => {
                    if let Some(le) = label(&labels, "le") {
                        *totals.buckets.entry(le.to_string()).or_default() += value;
                    }
                }
                _ => {}
            }
        }
        totals
    }

    /// Increase since `earlier`; a counter that went backwards restarted.
    fn since(&self, earlier: &Totals) -> Totals {
        let delta = |now: f64, then: f64| if now >= then { now - then } else { now };
        Totals {
            requests: delta(self.requests, earlier.requests),
            errors: delta(self.errors, earlier.errors),
            buckets: self
                .buckets
                .iter()
                .map(|(le, &now)| {
                    let then = earlier.buckets.get(le).copied().unwrap_or(0.0);
                    (le.clone(), delta(now, then))
                })
                .collect(),
        }
    }

    fn sorted_buckets(&self) -> Vec<(f64, f64)> {
        let mut buckets: Vec<(f64, f64)> = self
            .buckets
            .iter()
            .filter_map(|(le, &count)| parse_bound(le).map(|bound| (bound, count)))
            .collect();
        buckets.sort_by(|a, b| a.0.total_cmp(&b.0));
        buckets
    }

    fn to_sample(&self) -> GateSample {
        let buckets = self.sorted_buckets();
        GateSample {
            requests: self.requests,
            error_rate: if self.requests > 0.0 {
                self.errors / self.requests
            } else {
                0.0
            },
            p95: seconds(histogram_quantile(0.95, &buckets)),
            p99: seconds(histogram_quantile(0.99, &buckets)),
        }
    }
}

fn parse_bound(le: &str) -> Option<f64> {
    if le == "+Inf" {
        Some(f64::INFINITY)
    } else {
        le.parse().ok()
    }
}

fn label<'a>(labels: &'a [(String, String)], name: &str) -> Option<&'a str> {
    labels
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// One sample line of the text exposition format.
fn parse_line(line: &str) -> Option<(&str, Vec<(String, String)>, f64)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (name, labels, rest) = match line.find('{') {
        Some(open) => {
            let close = line.rfind('}')?;
            (
                &line[..open],
                parse_labels(&line[open + 1..close]),
                &line[close + 1..],
            )
        }
        None => {
            let (name, rest) = line.split_once(char::is_whitespace)?;
            (name, Vec::new(), rest)
        }
    };
    let value = rest.split_whitespace().next()?;
    let value = parse_bound(value)?;
    Some((name, labels, value))
}

fn parse_labels(body: &str) -> Vec<(String, String)> {
    let mut labels = Vec::new();
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut escaped = false;

    for c in body.chars() {
        if in_value {
            match c {
                _ if escaped => {
                    value.push(c);
                    escaped = false;
                }
                '\\' => escaped = true,
                '"' => {
                    labels.push((std::mem::take(&mut key), std::mem::take(&mut value)));
                    in_value = false;
                }
                _ => value.push(c),
            }
        } else {
            match c {
                '"' => in_value = true,
                '=' | ',' | ' ' => {}
                _ => key.push(c),
            }
        }
    }
    labels
}

/// Scrapes a `/metrics` endpoint and reports the increase since the
/// previous scrape.
#[derive(Debug)]
pub struct ScrapeSource {
    client: reqwest::Client,
    url: String,
    previous: Mutex<Option<Totals>>,
}

impl ScrapeSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            url: url.into(),
            previous: Mutex::new(None),
        })
    }

    fn advance(&self, current: Totals) -> GateSample {
        let mut previous = self.previous.lock().unwrap_or_else(|p| p.into_inner());
        let delta = match previous.as_ref() {
            Some(earlier) => current.since(earlier),
            None => current.clone(),
        };
        *previous = Some(current);
        delta.to_sample()
    }
}

#[async_trait]
impl MetricsSource for ScrapeSource {
    async fn sample(&self) -> Result<GateSample> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::upstream(format!("metrics scrape returned {}", status)));
        }
        let text = response.text().await?;
        Ok(self.advance(Totals::parse(&text)))
    }
}
