//! Configuration structures.
//!
//! Configuration is loaded from a YAML file and overlaid with `TOOLHUB_*`
//! environment variables. Every section has defaults so an empty file is a
//! valid config.

use crate::retry::RetryPolicy;
use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub assets: AssetsConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub jobs: JobsConfig,

    #[serde(default)]
    pub gate: GateConfig,
}

impl Config {
    /// Load from a YAML file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = if raw.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(&raw)?
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if let Some(v) = var("TOOLHUB_PUBLIC_ADDR") {
            self.server.public_addr = v;
        }
        if let Some(v) = var("TOOLHUB_INTERNAL_ADDR") {
            self.server.internal_addr = v;
        }
        if let Some(v) = var("TOOLHUB_DEFINITIONS_DIR") {
            self.catalog.definitions_dir = PathBuf::from(v);
        }
        if let Some(v) = var("TOOLHUB_DATABASE_PATH") {
            self.catalog.database_path = PathBuf::from(v);
        }
        if let Some(v) = var("TOOLHUB_INTERNAL_KEY") {
            self.secrets.internal_key = v;
        }
        if let Some(v) = var("TOOLHUB_MASTER_KEY") {
            self.secrets.master_key = v;
        }
        if let Some(v) = var("TOOLHUB_EMBEDDING_ENDPOINT") {
            self.embedding.endpoint = Some(v);
        }
        if let Some(v) = var("TOOLHUB_EMBEDDING_API_KEY") {
            self.embedding.api_key = Some(v);
        }
        if let Some(v) = var("TOOLHUB_LOG_FORMAT") {
            self.observability.json_logs = v.eq_ignore_ascii_case("json");
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        self.selector.weights.validate()?;
        if self.cache.max_size == 0 {
            return Err(Error::validation("cache.max_size must be at least 1"));
        }
        if self.pool.max_connections == 0 || self.pool.min_connections > self.pool.max_connections
        {
            return Err(Error::validation(format!(
                "pool bounds invalid: min={} max={}",
                self.pool.min_connections, self.pool.max_connections
            )));
        }
        if self.selector.max_k == 0 {
            return Err(Error::validation("selector.max_k must be at least 1"));
        }
        Ok(())
    }
}

/// Listener addresses. The internal listener carries the secrets broker and
/// must only be bound on the service-to-service network.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub public_addr: String,
    pub internal_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            public_addr: "127.0.0.1:8080".to_string(),
            internal_addr: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Where definitions and the catalog database live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub definitions_dir: PathBuf,
    pub database_path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            definitions_dir: PathBuf::from("tools"),
            database_path: PathBuf::from("toolhub.db"),
        }
    }
}

/// Hybrid score weights: `vector·cosine + keyword·overlap + preference·pref`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub vector: f64,
    pub keyword: f64,
    pub preference: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            vector: 0.6,
            keyword: 0.3,
            preference: 0.1,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> Result<()> {
        let all = [self.vector, self.keyword, self.preference];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::validation(
                "selector weights must be finite and non-negative",
            ));
        }
        if all.iter().all(|w| *w == 0.0) {
            return Err(Error::validation("selector weights cannot all be zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub weights: ScoreWeights,
    pub default_k: usize,
    pub max_k: usize,
    /// Budget for computing the query embedding before falling back to
    /// symbolic-only scoring.
    #[serde(with = "humantime_serde")]
    pub embed_timeout: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            default_k: 5,
            max_k: 50,
            embed_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size: 1000 }
    }
}

/// Connection pool bounds and timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    #[serde(with = "humantime_serde")]
    pub checkout_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            checkout_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// External embedding provider. With no endpoint the local hashing
/// embedder is used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Kick off an async backfill of changed patterns after every reload.
    pub backfill_on_reload: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            model: "hashing-256".to_string(),
            dimensions: 256,
            batch_size: 32,
            request_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            backfill_on_reload: true,
        }
    }
}

/// Secrets broker keys. Both are secret and never serialized back out.
#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecretsConfig {
    /// Shared key expected in `X-Internal-Key`.
    #[serde(skip_serializing)]
    pub internal_key: String,

    /// Base64 AES-256 key the asset directory encrypted credentials with.
    #[serde(skip_serializing)]
    pub master_key: String,
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("internal_key", &mask(&self.internal_key))
            .field("master_key", &mask(&self.master_key))
            .finish()
    }
}

/// First four characters, the rest starred out.
fn mask(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let visible: String = secret.chars().take(4).collect();
    format!("{}****", visible)
}

/// Asset directory source: an HTTP endpoint or a local inventory file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub directory_url: Option<String>,
    pub inventory_file: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            directory_url: None,
            inventory_file: None,
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Deadline for patterns that do not set `max_execution_time`.
    #[serde(with = "humantime_serde")]
    pub default_max_execution_time: Duration,

    /// Per-call timeout for asset resolver and secrets broker sub-calls.
    #[serde(with = "humantime_serde")]
    pub subcall_timeout: Duration,

    /// Retry policy for the enrichment sub-calls. The dispatched tool itself
    /// is never retried.
    pub retry: RetryPolicy,

    /// Remote broker base URL. When unset the in-process broker is used.
    pub broker_url: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_max_execution_time: Duration::from_secs(30),
            subcall_timeout: Duration::from_secs(3),
            retry: RetryPolicy::default(),
            broker_url: None,
        }
    }
}

/// External job scheduler reached via submit/poll/cancel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub scheduler_url: Option<String>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            scheduler_url: None,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Release gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub max_error_rate: f64,
    #[serde(with = "humantime_serde")]
    pub max_p95: Duration,
    #[serde(with = "humantime_serde")]
    pub max_p99: Duration,
    /// Violating samples tolerated within one window.
    pub violation_budget: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(300),
            poll_interval: Duration::from_secs(15),
            max_error_rate: 0.01,
            max_p95: Duration::from_secs(1),
            max_p99: Duration::from_secs(2),
            violation_budget: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.cache.max_size, 1000);
        assert_eq!(config.pool.max_connections, 10);
    }

    #[test]
    fn test_yaml_overrides_and_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "selector:\n  weights: {{ vector: 0.5, keyword: 0.5, preference: 0.0 }}\n  default_k: 3\n  max_k: 10\n  embed_timeout: 250ms\npool:\n  min_connections: 1\n  max_connections: 4\n  checkout_timeout: 1s\n  idle_timeout: 1m\n  reap_interval: 10s"
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.selector.weights.keyword, 0.5);
        assert_eq!(config.selector.embed_timeout, Duration::from_millis(250));
        assert_eq!(config.pool.idle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_rejects_negative_weights() {
        let weights = ScoreWeights {
            vector: -1.0,
            keyword: 0.5,
            preference: 0.5,
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_weights() {
        let weights = ScoreWeights {
            vector: 0.0,
            keyword: 0.0,
            preference: 0.0,
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_pool_bounds() {
        let mut config = Config::default();
        config.pool.min_connections = 8;
        config.pool.max_connections = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_secret_keys_not_serialized() {
        let mut config = Config::default();
        config.secrets.internal_key = "super-secret".to_string();
        let out = serde_yaml::to_string(&config).unwrap();
        assert!(!out.contains("super-secret"));
    }
}
