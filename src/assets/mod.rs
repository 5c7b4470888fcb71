//! Asset directory client and resolver.
//!
//! Assets and credentials belong to an external inventory. This module only
//! reads them: `StaticAssetDirectory` serves a YAML inventory file,
//! `HttpAssetDirectory` queries a remote directory service. Credential
//! secrets stay encrypted here; only the secrets broker decrypts them.

use crate::retry::{with_retry, RetryPolicy};
use crate::types::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How to reach an asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionProfile {
    /// `ssh`, `winrm`, `https`, ...
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Asset {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub platform: String,
    pub connection: ConnectionProfile,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Asset {
    /// Matches on host name (case-insensitive) or IP.
    pub fn matches(&self, host: &str) -> bool {
        self.host.eq_ignore_ascii_case(host) || self.ip.as_deref() == Some(host)
    }
}

/// Encrypted credential keyed by `(asset, purpose)`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub asset_host: String,
    pub purpose: String,
    pub username: String,
    /// Base64 `nonce || ciphertext` under the broker master key.
    pub encrypted_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("asset_host", &self.asset_host)
            .field("purpose", &self.purpose)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Inventory file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Inventory {
    pub assets: Vec<Asset>,
    pub credentials: Vec<Credential>,
}

/// Read side of the asset directory.
#[async_trait]
pub trait AssetDirectory: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Option<Asset>>;

    /// Every credential stored for `host`.
    async fn credentials(&self, host: &str) -> Result<Vec<Credential>>;

    /// Every credential in the directory.
    async fn list_credentials(&self) -> Result<Vec<Credential>>;
}

pub type SharedDirectory = Arc<dyn AssetDirectory>;

// =============================================================================
// Static inventory
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct StaticAssetDirectory {
    inventory: Inventory,
}

impl StaticAssetDirectory {
    pub fn new(inventory: Inventory) -> Self {
        Self { inventory }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let inventory: Inventory = serde_yaml::from_str(&raw).map_err(|e| {
            Error::validation(format!("inventory {}: {}", path.display(), e))
        })?;
        tracing::info!(
            path = %path.display(),
            assets = inventory.assets.len(),
            credentials = inventory.credentials.len(),
            "asset inventory loaded"
        );
        Ok(Self::new(inventory))
    }
}

#[async_trait]
impl AssetDirectory for StaticAssetDirectory {
    async fn resolve(&self, host: &str) -> Result<Option<Asset>> {
        Ok(self.inventory.assets.iter().find(|a| a.matches(host)).cloned())
    }

    async fn credentials(&self, host: &str) -> Result<Vec<Credential>> {
        let Some(asset) = self.inventory.assets.iter().find(|a| a.matches(host)) else {
            return Ok(Vec::new());
        };
        Ok(self
            .inventory
            .credentials
            .iter()
            .filter(|c| asset.matches(&c.asset_host))
            .cloned()
            .collect())
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>> {
        Ok(self.inventory.credentials.clone())
    }
}

// =============================================================================
// HTTP directory
// =============================================================================

/// Remote directory: `GET /assets/{host}`, `GET /assets/{host}/credentials`,
/// `GET /credentials`.
#[derive(Debug, Clone)]
pub struct HttpAssetDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAssetDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("asset directory client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::upstream(format!("asset directory returned {}", status)));
        }
        Ok(Some(response.json().await?))
    }
}

/// Directory path for one host; the host is a single encoded segment.
fn asset_path(host: &str, suffix: &str) -> String {
    format!("/assets/{}{}", urlencoding::encode(host), suffix)
}

#[async_trait]
impl AssetDirectory for HttpAssetDirectory {
    async fn resolve(&self, host: &str) -> Result<Option<Asset>> {
        self.get(&asset_path(host, "")).await
    }

    async fn credentials(&self, host: &str) -> Result<Vec<Credential>> {
        Ok(self
            .get(&asset_path(host, "/credentials"))
            .await?
            .unwrap_or_default())
    }

    async fn list_credentials(&self) -> Result<Vec<Credential>> {
        Ok(self.get("/credentials").await?.unwrap_or_default())
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Directory lookups bounded by a per-call timeout and retried when
/// transient. A miss is `asset_not_found`.
#[derive(Clone)]
pub struct AssetResolver {
    directory: SharedDirectory,
    timeout: Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for AssetResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetResolver")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl AssetResolver {
    pub fn new(directory: SharedDirectory, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            directory,
            timeout,
            retry,
        }
    }

    pub fn directory(&self) -> &SharedDirectory {
        &self.directory
    }

    pub async fn resolve(&self, host: &str) -> Result<Asset> {
        let found = with_retry(&self.retry, "asset lookup", || {
            let directory = self.directory.clone();
            let host = host.to_string();
            let timeout = self.timeout;
            async move { bounded(timeout, "asset lookup", directory.resolve(&host)).await }
        })
        .await?;
        found.ok_or_else(|| Error::asset_not_found(host.to_string()))
    }

    pub async fn credentials(&self, host: &str) -> Result<Vec<Credential>> {
        with_retry(&self.retry, "credential lookup", || {
            let directory = self.directory.clone();
            let host = host.to_string();
            let timeout = self.timeout;
            async move { bounded(timeout, "credential lookup", directory.credentials(&host)).await }
        })
        .await
    }

    pub async fn list_credentials(&self) -> Result<Vec<Credential>> {
        with_retry(&self.retry, "credential listing", || {
            let directory = self.directory.clone();
            let timeout = self.timeout;
            async move { bounded(timeout, "credential listing", directory.list_credentials()).await }
        })
        .await
    }
}

async fn bounded<T>(
    timeout: Duration,
    what: &str,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::timeout(format!("{} exceeded {}ms", what, timeout.as_millis())))?
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    pub(crate) fn inventory(credentials: Vec<Credential>) -> Inventory {
        Inventory {
            assets: vec![
                Asset {
                    host: "db01.lan".into(),
                    ip: Some("10.0.0.5".into()),
                    platform: "linux".into(),
                    connection: ConnectionProfile {
                        protocol: "ssh".into(),
                        port: Some(22),
                    },
                    tags: vec!["database".into()],
                },
                Asset {
                    host: "win01.lan".into(),
                    ip: None,
                    platform: "windows".into(),
                    connection: ConnectionProfile {
                        protocol: "winrm".into(),
                        port: Some(5986),
                    },
                    tags: vec![],
                },
            ],
            credentials,
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn test_resolve_by_host_or_ip() {
        let dir = StaticAssetDirectory::new(inventory(vec![]));
        assert!(dir.resolve("DB01.lan").await.unwrap().is_some());
        assert!(dir.resolve("10.0.0.5").await.unwrap().is_some());
        assert!(dir.resolve("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolver_miss_is_asset_not_found() {
        let resolver = AssetResolver::new(
            Arc::new(StaticAssetDirectory::new(inventory(vec![]))),
            Duration::from_secs(1),
            fast(),
        );
        assert_eq!(resolver.resolve("db01.lan").await.unwrap().platform, "linux");
        let err = resolver.resolve("ghost.lan").await.unwrap_err();
        assert_eq!(err.code(), "asset_not_found");
    }

    struct Flaky {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AssetDirectory for Flaky {
        async fn resolve(&self, _host: &str) -> Result<Option<Asset>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::upstream("503"))
            } else {
                Ok(inventory(vec![]).assets.into_iter().next())
            }
        }

        async fn credentials(&self, _host: &str) -> Result<Vec<Credential>> {
            Ok(vec![])
        }

        async fn list_credentials(&self) -> Result<Vec<Credential>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_resolver_retries_transient_failures() {
        let flaky = Arc::new(Flaky {
            calls: AtomicU32::new(0),
        });
        let resolver = AssetResolver::new(flaky.clone(), Duration::from_secs(1), fast());
        assert_eq!(resolver.resolve("db01.lan").await.unwrap().host, "db01.lan");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_inventory_yaml() {
        let yaml = r#"
assets:
  - host: web01
    platform: linux
    connection: { protocol: ssh }
credentials:
  - asset_host: web01
    purpose: ssh
    username: deploy
    encrypted_secret: AAAA
"#;
        let inv: Inventory = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(inv.assets[0].connection.port, None);
        assert_eq!(inv.credentials[0].purpose, "ssh");
        assert!(!format!("{:?}", inv.credentials[0]).contains("AAAA"));
    }

    #[test]
    fn test_asset_path_encodes_host() {
        assert_eq!(asset_path("db01.lan", ""), "/assets/db01.lan");
        assert_eq!(
            asset_path("a/b?c#d", "/credentials"),
            "/assets/a%2Fb%3Fc%23d/credentials"
        );
    }
}
