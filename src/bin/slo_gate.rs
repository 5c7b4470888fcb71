//! Release gate CLI.
//!
//! Exit codes: 0 when the window passes, 1 on a threshold breach, 2 when the
//! gate could not be set up.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use toolhub_core::gate::{MetricsSource, PrometheusSource, ScrapeSource, SloGate};
use toolhub_core::types::GateConfig;
use toolhub_core::{Config, Result};

fn duration(value: &str) -> std::result::Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[derive(Debug, Parser)]
#[command(name = "slo-gate", version, about = "Block a release when live SLOs are breached")]
struct Args {
    /// Prometheus base URL (queries /api/v1/query).
    #[arg(long, conflicts_with = "scrape_url", required_unless_present = "scrape_url")]
    prometheus_url: Option<String>,

    /// A service /metrics endpoint to scrape directly.
    #[arg(long)]
    scrape_url: Option<String>,

    /// Config file whose `gate` section supplies the defaults.
    #[arg(short, long, env = "TOOLHUB_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_parser = duration)]
    window: Option<Duration>,

    #[arg(long, value_parser = duration)]
    poll_interval: Option<Duration>,

    /// Maximum error rate as a fraction (0.01 = 1%).
    #[arg(long)]
    max_error_rate: Option<f64>,

    #[arg(long, value_parser = duration)]
    max_p95: Option<Duration>,

    #[arg(long, value_parser = duration)]
    max_p99: Option<Duration>,

    #[arg(long)]
    violation_budget: Option<u32>,

    /// Emit the verdict as JSON on stdout.
    #[arg(long)]
    json: bool,
}

impl Args {
    fn gate_config(&self) -> Result<GateConfig> {
        let mut gate = match &self.config {
            Some(path) => Config::load(path)?.gate,
            None => GateConfig::default(),
        };
        if let Some(v) = self.window {
            gate.window = v;
        }
        if let Some(v) = self.poll_interval {
            gate.poll_interval = v;
        }
        if let Some(v) = self.max_error_rate {
            gate.max_error_rate = v;
        }
        if let Some(v) = self.max_p95 {
            gate.max_p95 = v;
        }
        if let Some(v) = self.max_p99 {
            gate.max_p99 = v;
        }
        if let Some(v) = self.violation_budget {
            gate.violation_budget = v;
        }
        Ok(gate)
    }

    fn source(&self, gate: &GateConfig) -> Result<Arc<dyn MetricsSource>> {
        let timeout = gate.poll_interval.max(Duration::from_secs(5));
        match (&self.prometheus_url, &self.scrape_url) {
            (Some(url), _) => Ok(Arc::new(PrometheusSource::new(
                url.clone(),
                gate.poll_interval.max(Duration::from_secs(60)),
                timeout,
            )?)),
            (None, Some(url)) => Ok(Arc::new(ScrapeSource::new(url.clone(), timeout)?)),
            (None, None) => Err(toolhub_core::Error::validation(
                "one of --prometheus-url or --scrape-url is required",
            )),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    toolhub_core::observability::init_tracing(&Default::default());

    let setup = args
        .gate_config()
        .and_then(|gate| Ok((args.source(&gate)?, gate)));
    let (source, gate) = match setup {
        Ok(parts) => parts,
        Err(err) => {
            eprintln!("slo-gate: {}", err);
            return ExitCode::from(2);
        }
    };

    match SloGate::new(source, gate).run().await {
        Ok(verdict) => {
            if args.json {
                match serde_json::to_string(&verdict) {
                    Ok(line) => println!("{}", line),
                    Err(err) => eprintln!("slo-gate: {}", err),
                }
            } else {
                for reason in &verdict.reasons {
                    println!("violation: {}", reason);
                }
                println!(
                    "{} after {} samples ({} violations)",
                    if verdict.passed { "PASS" } else { "FAIL" },
                    verdict.samples,
                    verdict.violations
                );
            }
            if verdict.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
        Err(err) => {
            eprintln!("slo-gate: {}", err);
            ExitCode::from(2)
        }
    }
}
