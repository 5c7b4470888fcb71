//! Service assembly.
//!
//! Builds every component from a `Config`. External collaborators (asset
//! directory, embedding provider, job scheduler) can be injected, which is
//! how the integration tests run the full stack without network services.

use crate::assets::{AssetResolver, HttpAssetDirectory, SharedDirectory, StaticAssetDirectory};
use crate::catalog::{CatalogLoader, CatalogRegistry, ExecutionMethod, LoadReport};
use crate::embedding::{self, EmbeddingIndexer, SharedEmbedder};
use crate::execution::{
    BuiltinRunner, CommandRunner, ExecutionProxy, HttpJobScheduler, JobRunner, RunnerRegistry,
    SharedScheduler,
};
use crate::metrics::ServiceMetrics;
use crate::secrets::{CredentialSource, RemoteBrokerClient, SecretCipher, SecretsBroker};
use crate::selector::HybridSelector;
use crate::server::AppState;
use crate::storage::CatalogStore;
use crate::types::{Config, Result};
use std::sync::Arc;

/// Optional stand-ins for the external services.
#[derive(Default)]
pub struct Collaborators {
    pub directory: Option<SharedDirectory>,
    pub embedder: Option<SharedEmbedder>,
    pub scheduler: Option<SharedScheduler>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("directory", &self.directory.is_some())
            .field("embedder", &self.embedder.is_some())
            .field("scheduler", &self.scheduler.is_some())
            .finish()
    }
}

fn asset_directory(config: &Config) -> Result<SharedDirectory> {
    if let Some(url) = &config.assets.directory_url {
        return Ok(Arc::new(HttpAssetDirectory::new(
            url.clone(),
            config.assets.request_timeout,
        )?));
    }
    if let Some(path) = &config.assets.inventory_file {
        return Ok(Arc::new(StaticAssetDirectory::from_file(path)?));
    }
    tracing::warn!("no asset directory configured, every host lookup will miss");
    Ok(Arc::new(StaticAssetDirectory::default()))
}

fn cipher(config: &Config) -> Result<SecretCipher> {
    if config.secrets.master_key.is_empty() {
        tracing::warn!("no master key configured, using an ephemeral key; stored credentials will not decrypt");
        Ok(SecretCipher::ephemeral())
    } else {
        SecretCipher::from_base64(&config.secrets.master_key)
    }
}

/// Wire up every component. Nothing is loaded or started yet.
pub async fn build(config: &Config, collaborators: Collaborators) -> Result<AppState> {
    let metrics = ServiceMetrics::new()?;

    if let Some(parent) = config.catalog.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(
        CatalogStore::open(config.catalog.database_path.clone(), config.pool.clone()).await?,
    );
    let registry = Arc::new(CatalogRegistry::new());

    let embedder = match collaborators.embedder {
        Some(embedder) => embedder,
        None => embedding::from_config(&config.embedding)?,
    };
    let indexer = Arc::new(EmbeddingIndexer::new(
        store.clone(),
        registry.clone(),
        embedder.clone(),
        config.embedding.batch_size,
        config.embedding.retry.clone(),
    ));

    let mut loader = CatalogLoader::new(
        store.clone(),
        registry.clone(),
        config.catalog.definitions_dir.clone(),
    )
    .with_metrics(metrics.clone());
    if config.embedding.backfill_on_reload {
        loader = loader.with_backfill(indexer.clone());
    }

    let selector = HybridSelector::new(
        registry.clone(),
        Some(embedder),
        config.selector.clone(),
        config.cache.max_size,
    )
    .with_metrics(metrics.clone());

    let directory = match collaborators.directory {
        Some(directory) => directory,
        None => asset_directory(config)?,
    };
    let resolver = AssetResolver::new(
        directory,
        config.execution.subcall_timeout,
        config.execution.retry.clone(),
    );
    let broker = Arc::new(SecretsBroker::new(
        resolver.clone(),
        cipher(config)?,
        &config.secrets.internal_key,
    ));
    let credentials: Arc<dyn CredentialSource> = match &config.execution.broker_url {
        Some(url) => Arc::new(RemoteBrokerClient::new(
            url.clone(),
            config.secrets.internal_key.clone(),
            config.execution.subcall_timeout,
            config.execution.retry.clone(),
        )?),
        None => broker.clone(),
    };

    let mut runners = RunnerRegistry::new()
        .with(ExecutionMethod::Builtin, Arc::new(BuiltinRunner))
        .with(ExecutionMethod::Command, Arc::new(CommandRunner));
    let scheduler: Option<SharedScheduler> = match collaborators.scheduler {
        Some(scheduler) => Some(scheduler),
        None => match &config.jobs.scheduler_url {
            Some(url) => Some(Arc::new(HttpJobScheduler::new(
                url.clone(),
                config.execution.subcall_timeout,
            )?)),
            None => None,
        },
    };
    if let Some(scheduler) = scheduler {
        runners = runners.with(
            ExecutionMethod::Job,
            Arc::new(JobRunner::new(scheduler, config.jobs.poll_interval)),
        );
    }

    let proxy = ExecutionProxy::new(
        registry.clone(),
        resolver,
        credentials,
        runners,
        metrics.clone(),
        config.execution.clone(),
    );

    Ok(AppState {
        registry,
        store,
        loader: Arc::new(loader),
        selector: Arc::new(selector),
        proxy: Arc::new(proxy),
        broker,
        indexer: Some(indexer),
        metrics,
    })
}

/// Publish what the store holds, then apply the definitions directory on
/// top. A bad definitions directory leaves the restored catalog serving.
pub async fn bootstrap(state: &AppState) -> Result<Option<LoadReport>> {
    let restored = state.loader.restore().await?;
    tracing::info!(
        generation = restored,
        tools = state.registry.snapshot().tool_count(),
        "catalog restored from store"
    );

    if !state.loader.definitions_dir().is_dir() {
        tracing::warn!(
            dir = %state.loader.definitions_dir().display(),
            "definitions directory missing, serving stored catalog"
        );
        return Ok(None);
    }
    match state.loader.reload().await {
        Ok(report) => Ok(Some(report)),
        Err(err) => {
            tracing::error!(error = %err, "initial definitions load failed");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TraceId;
    use crate::execution::ExecuteRequest;
    use serde_json::json;

    const ECHO: &str = r#"
name: echo
version: "1.0.0"
category: utility
execution_method: builtin
entrypoint: echo
capabilities:
  - name: echo
    patterns:
      - name: echo_text
        description: Return the given text
        allow_extra_inputs: true
"#;

    #[tokio::test]
    async fn test_build_and_bootstrap_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let defs = dir.path().join("tools");
        std::fs::create_dir(&defs).unwrap();
        std::fs::write(defs.join("echo.yaml"), ECHO).unwrap();

        let mut config = Config::default();
        config.catalog.definitions_dir = defs;
        config.catalog.database_path = dir.path().join("db").join("catalog.db");
        config.embedding.backfill_on_reload = false;

        let state = build(&config, Collaborators::default()).await.unwrap();
        let report = bootstrap(&state).await.unwrap().unwrap();
        assert_eq!(report.count, 1);

        let response = state
            .proxy
            .execute(ExecuteRequest::new("echo", json!({"input": "ping"})), TraceId::new())
            .await;
        assert_eq!(response.output, Some(json!("pong")));
    }

    #[tokio::test]
    async fn test_missing_definitions_dir_serves_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.catalog.definitions_dir = dir.path().join("absent");
        config.catalog.database_path = dir.path().join("catalog.db");

        let state = build(&config, Collaborators::default()).await.unwrap();
        assert!(bootstrap(&state).await.unwrap().is_none());
        assert_eq!(state.registry.snapshot().tool_count(), 0);
    }
}
