//! Secrets broker.
//!
//! The only component holding decryption authority. Every entry point is
//! gated by the shared internal key; the HTTP routes that expose it live on
//! the internal listener only.

use crate::assets::{AssetResolver, Credential};
use crate::secrets::cipher::SecretCipher;
use crate::types::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;

/// Decrypted credential handed to a runner.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub username: String,
    pub secret: String,
    pub protocol: String,
}

impl std::fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    pub failed: usize,
}

/// Where the execution proxy gets credentials from.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn lookup(&self, host: &str, purpose: &str) -> Result<ResolvedCredential>;
}

type CacheKey = (String, String);

fn cache_key(host: &str, purpose: &str) -> CacheKey {
    (host.to_ascii_lowercase(), purpose.to_ascii_lowercase())
}

pub struct SecretsBroker {
    assets: AssetResolver,
    cipher: SecretCipher,
    internal_key_digest: Option<[u8; 32]>,
    cache: RwLock<HashMap<CacheKey, ResolvedCredential>>,
}

impl std::fmt::Debug for SecretsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsBroker")
            .field("key_configured", &self.internal_key_digest.is_some())
            .finish_non_exhaustive()
    }
}

impl SecretsBroker {
    /// An empty `internal_key` locks every gated call.
    pub fn new(assets: AssetResolver, cipher: SecretCipher, internal_key: &str) -> Self {
        let internal_key_digest = if internal_key.is_empty() {
            tracing::warn!("no internal key configured, secrets broker rejects all callers");
            None
        } else {
            Some(Sha256::digest(internal_key.as_bytes()).into())
        };
        Self {
            assets,
            cipher,
            internal_key_digest,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Check the caller's `X-Internal-Key`. The error says nothing about how
    /// close the key was.
    pub fn authorize(&self, provided: Option<&str>) -> Result<()> {
        let (Some(expected), Some(provided)) = (&self.internal_key_digest, provided) else {
            return Err(Error::Forbidden);
        };
        let provided: [u8; 32] = Sha256::digest(provided.as_bytes()).into();
        let diff = expected
            .iter()
            .zip(provided.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        if diff == 0 {
            Ok(())
        } else {
            Err(Error::Forbidden)
        }
    }

    /// Decrypted credential for `(host, purpose)`.
    pub async fn credential_lookup(&self, host: &str, purpose: &str) -> Result<ResolvedCredential> {
        if host.trim().is_empty() || purpose.trim().is_empty() {
            return Err(Error::validation("host and purpose are required"));
        }
        let asset = self.assets.resolve(host).await?;
        let key = cache_key(&asset.host, purpose);
        let cached = self.read_cache().get(&key).cloned();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let credential = self
            .assets
            .credentials(&asset.host)
            .await?
            .into_iter()
            .find(|c| c.purpose.eq_ignore_ascii_case(purpose))
            .ok_or_else(|| {
                Error::missing_credentials(format!("no '{}' credential for {}", purpose, asset.host))
            })?;

        let resolved = self.open(&credential, &asset.connection.protocol)?;
        self.write_cache().insert(key, resolved.clone());
        tracing::info!(host = %asset.host, purpose, "credential resolved");
        Ok(resolved)
    }

    /// Refresh the broker-local cache from the directory's encrypted store.
    pub async fn import_from_assets(&self) -> Result<ImportReport> {
        let credentials = self.assets.list_credentials().await?;
        let mut report = ImportReport::default();
        let mut fresh = HashMap::new();

        for credential in &credentials {
            let protocol = match self.assets.directory().resolve(&credential.asset_host).await {
                Ok(Some(asset)) => asset.connection.protocol,
                _ => credential.purpose.clone(),
            };
            match self.open(credential, &protocol) {
                Ok(resolved) => {
                    fresh.insert(cache_key(&credential.asset_host, &credential.purpose), resolved);
                    report.imported += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        host = %credential.asset_host,
                        purpose = %credential.purpose,
                        error = %err,
                        "credential import failed"
                    );
                    report.failed += 1;
                }
            }
        }

        *self.write_cache() = fresh;
        tracing::info!(
            imported = report.imported,
            failed = report.failed,
            "credentials imported from asset directory"
        );
        Ok(report)
    }

    fn open(&self, credential: &Credential, fallback_protocol: &str) -> Result<ResolvedCredential> {
        Ok(ResolvedCredential {
            username: credential.username.clone(),
            secret: self.cipher.decrypt(&credential.encrypted_secret)?,
            protocol: credential
                .protocol
                .clone()
                .unwrap_or_else(|| fallback_protocol.to_string()),
        })
    }

    fn read_cache(&self) -> std::sync::RwLockReadGuard<'_, HashMap<CacheKey, ResolvedCredential>> {
        self.cache.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_cache(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<CacheKey, ResolvedCredential>> {
        self.cache.write().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CredentialSource for SecretsBroker {
    async fn lookup(&self, host: &str, purpose: &str) -> Result<ResolvedCredential> {
        self.credential_lookup(host, purpose).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::assets::tests::inventory;
    use crate::assets::StaticAssetDirectory;
    use crate::retry::RetryPolicy;
    use std::sync::Arc;
    use std::time::Duration;

    pub(crate) fn broker_with(credentials: &[(&str, &str, &str, &str)]) -> SecretsBroker {
        let cipher = SecretCipher::ephemeral();
        let creds = credentials
            .iter()
            .map(|(host, purpose, user, secret)| Credential {
                asset_host: host.to_string(),
                purpose: purpose.to_string(),
                username: user.to_string(),
                encrypted_secret: cipher.encrypt(secret).unwrap(),
                protocol: None,
            })
            .collect();
        let resolver = AssetResolver::new(
            Arc::new(StaticAssetDirectory::new(inventory(creds))),
            Duration::from_secs(1),
            RetryPolicy::none(),
        );
        SecretsBroker::new(resolver, cipher, "s3cret-internal")
    }

    #[test]
    fn test_authorize() {
        let broker = broker_with(&[]);
        assert!(broker.authorize(Some("s3cret-internal")).is_ok());
        assert!(matches!(broker.authorize(Some("s3cret-internaX")), Err(Error::Forbidden)));
        assert!(matches!(broker.authorize(Some("")), Err(Error::Forbidden)));
        assert!(matches!(broker.authorize(None), Err(Error::Forbidden)));
    }

    #[test]
    fn test_unconfigured_key_rejects_everyone() {
        let resolver = AssetResolver::new(
            Arc::new(StaticAssetDirectory::default()),
            Duration::from_secs(1),
            RetryPolicy::none(),
        );
        let broker = SecretsBroker::new(resolver, SecretCipher::ephemeral(), "");
        assert!(broker.authorize(Some("")).is_err());
        assert!(broker.authorize(Some("anything")).is_err());
    }

    #[tokio::test]
    async fn test_lookup_decrypts_and_defaults_protocol() {
        let broker = broker_with(&[("db01.lan", "ssh", "ops", "pa55")]);
        let cred = broker.credential_lookup("10.0.0.5", "SSH").await.unwrap();
        assert_eq!(cred.username, "ops");
        assert_eq!(cred.secret, "pa55");
        assert_eq!(cred.protocol, "ssh");
        assert!(!format!("{:?}", cred).contains("pa55"));
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let broker = broker_with(&[("db01.lan", "ssh", "ops", "pa55")]);
        let err = broker.credential_lookup("ghost", "ssh").await.unwrap_err();
        assert_eq!(err.code(), "asset_not_found");
        let err = broker.credential_lookup("win01.lan", "winrm").await.unwrap_err();
        assert_eq!(err.code(), "missing_credentials");
        let err = broker.credential_lookup("", "ssh").await.unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[tokio::test]
    async fn test_import_counts_undecryptable() {
        let mut broker = broker_with(&[
            ("db01.lan", "ssh", "ops", "pa55"),
            ("win01.lan", "winrm", "admin", "w1n"),
        ]);
        let report = broker.import_from_assets().await.unwrap();
        assert_eq!(report, ImportReport { imported: 2, failed: 0 });

        broker.cipher = SecretCipher::ephemeral();
        let report = broker.import_from_assets().await.unwrap();
        assert_eq!(report, ImportReport { imported: 0, failed: 2 });
    }
}
