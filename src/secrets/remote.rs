//! Client for a broker running as a separate service.

use crate::retry::{with_retry, RetryPolicy};
use crate::secrets::broker::{CredentialSource, ResolvedCredential};
use crate::types::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const INTERNAL_KEY_HEADER: &str = "X-Internal-Key";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Calls `POST {base}/internal/secrets/credential-lookup` on the internal
/// network.
pub struct RemoteBrokerClient {
    client: reqwest::Client,
    base_url: String,
    internal_key: String,
    retry: RetryPolicy,
}

impl std::fmt::Debug for RemoteBrokerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBrokerClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RemoteBrokerClient {
    pub fn new(
        base_url: impl Into<String>,
        internal_key: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal(format!("broker client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            internal_key: internal_key.into(),
            retry,
        })
    }

    async fn lookup_once(&self, host: &str, purpose: &str) -> Result<ResolvedCredential> {
        let response = self
            .client
            .post(format!("{}/internal/secrets/credential-lookup", self.base_url))
            .header(INTERNAL_KEY_HEADER, &self.internal_key)
            .json(&serde_json::json!({ "host": host, "purpose": purpose }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        if status.is_server_error() {
            return Err(Error::upstream(format!("secrets broker returned {}", status)));
        }
        let body: ErrorBody = response.json().await.unwrap_or(ErrorBody {
            error: String::new(),
            message: String::new(),
        });
        Err(map_error_code(&body.error, body.message, host))
    }
}

fn map_error_code(code: &str, message: String, host: &str) -> Error {
    match code {
        "asset_not_found" => Error::asset_not_found(host.to_string()),
        "missing_credentials" => Error::missing_credentials(message),
        "validation_error" => Error::validation(message),
        "forbidden" => Error::Forbidden,
        _ => Error::upstream(format!("secrets broker error '{}': {}", code, message)),
    }
}

#[async_trait]
impl CredentialSource for RemoteBrokerClient {
    async fn lookup(&self, host: &str, purpose: &str) -> Result<ResolvedCredential> {
        with_retry(&self.retry, "secrets broker", move || self.lookup_once(host, purpose)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_back() {
        assert_eq!(map_error_code("asset_not_found", String::new(), "h").code(), "asset_not_found");
        assert_eq!(
            map_error_code("missing_credentials", "x".into(), "h").code(),
            "missing_credentials"
        );
        assert!(matches!(map_error_code("forbidden", String::new(), "h"), Error::Forbidden));
        assert_eq!(map_error_code("weird", String::new(), "h").code(), "upstream_error");
    }
}
