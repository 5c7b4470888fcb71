//! Definition loading and hot reload.
//!
//! `reload` rescans the definitions directory, parses and validates every
//! file, applies the set to the store in one transaction, then publishes a
//! fresh snapshot. Any failure before the publish leaves the serving
//! snapshot untouched.

use crate::catalog::model::Tool;
use crate::catalog::registry::CatalogRegistry;
use crate::embedding::EmbeddingIndexer;
use crate::metrics::ServiceMetrics;
use crate::storage::{ApplyReport, CatalogStore};
use crate::types::{Error, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One definition document and where it came from.
#[derive(Debug, Clone)]
pub struct DefinitionSource {
    pub origin: String,
    pub contents: String,
}

impl DefinitionSource {
    pub fn new(origin: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            contents: contents.into(),
        }
    }
}

/// Result of a load or reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Selectable tools after the load.
    pub count: usize,
    pub generation: u64,
}

impl LoadReport {
    fn new(apply: ApplyReport, count: usize, generation: u64) -> Self {
        Self {
            added: apply.added,
            updated: apply.updated,
            removed: apply.removed,
            unchanged: apply.unchanged,
            count,
            generation,
        }
    }
}

/// Parse and validate a set of definitions without touching any state.
pub fn parse_definitions(sources: &[DefinitionSource]) -> Result<Vec<Tool>> {
    let mut tools = Vec::with_capacity(sources.len());
    let mut seen = HashSet::new();
    for source in sources {
        let mut tool: Tool = serde_yaml::from_str(&source.contents).map_err(|e| {
            Error::definition(&source.origin, yaml_field(&e), e.to_string())
        })?;
        tool.compile(&source.origin)?;
        if !seen.insert((tool.name.clone(), tool.version.clone())) {
            return Err(Error::definition(
                &source.origin,
                "version",
                format!("{}@{} defined more than once", tool.name, tool.version),
            ));
        }
        tools.push(tool);
    }
    Ok(tools)
}

fn yaml_field(err: &serde_yaml::Error) -> String {
    match err.location() {
        Some(loc) => format!("line {} column {}", loc.line(), loc.column()),
        None => "document".to_string(),
    }
}

/// Read every `*.yaml` / `*.yml` file in `dir`, sorted by file name.
pub fn read_definitions_dir(dir: &Path) -> Result<Vec<DefinitionSource>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| Error::validation(format!("definitions dir {}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let contents = std::fs::read_to_string(&path)?;
            let origin = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(DefinitionSource { origin, contents })
        })
        .collect()
}

pub struct CatalogLoader {
    store: Arc<CatalogStore>,
    registry: Arc<CatalogRegistry>,
    definitions_dir: PathBuf,
    indexer: Option<Arc<EmbeddingIndexer>>,
    metrics: Option<ServiceMetrics>,
    reload_lock: Mutex<()>,
    /// Set once the store holds changes the registry has not published yet.
    publish_pending: AtomicBool,
}

impl std::fmt::Debug for CatalogLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatalogLoader")
            .field("definitions_dir", &self.definitions_dir)
            .field("backfill", &self.indexer.is_some())
            .finish_non_exhaustive()
    }
}

impl CatalogLoader {
    pub fn new(
        store: Arc<CatalogStore>,
        registry: Arc<CatalogRegistry>,
        definitions_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            registry,
            definitions_dir: definitions_dir.into(),
            indexer: None,
            metrics: None,
            reload_lock: Mutex::new(()),
            publish_pending: AtomicBool::new(false),
        }
    }

    /// Kick off an async embedding backfill after each successful load.
    pub fn with_backfill(mut self, indexer: Arc<EmbeddingIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    pub fn with_metrics(mut self, metrics: ServiceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn definitions_dir(&self) -> &Path {
        &self.definitions_dir
    }

    /// Publish whatever the store already holds (startup before the first
    /// definitions scan).
    pub async fn restore(&self) -> Result<u64> {
        let _guard = self.reload_lock.lock().await;
        self.publish_from_store().await
    }

    /// Apply a complete definition set.
    pub async fn load(&self, sources: Vec<DefinitionSource>) -> Result<LoadReport> {
        let _guard = self.reload_lock.lock().await;
        let result = self.load_locked(sources).await;
        self.record(&result);
        result
    }

    /// Rescan the definitions directory and apply it.
    pub async fn reload(&self) -> Result<LoadReport> {
        let _guard = self.reload_lock.lock().await;
        let dir = self.definitions_dir.clone();
        let result = match tokio::task::spawn_blocking(move || read_definitions_dir(&dir)).await {
            Ok(Ok(sources)) => self.load_locked(sources).await,
            Ok(Err(err)) => Err(err),
            Err(join) => Err(Error::internal(format!("definition scan failed: {}", join))),
        };
        self.record(&result);
        result
    }

    async fn load_locked(&self, sources: Vec<DefinitionSource>) -> Result<LoadReport> {
        let files = sources.len();
        let tools = parse_definitions(&sources)?;
        let applied = self.store.apply_definitions(tools).await?;
        if applied.added + applied.updated + applied.removed > 0 {
            self.publish_pending.store(true, Ordering::Release);
        }
        // A no-op reload keeps the generation, so cached searches stay valid,
        // unless an earlier publish of committed changes failed.
        let generation = if self.publish_pending.load(Ordering::Acquire)
            || self.registry.generation() == 0
        {
            self.publish_from_store().await?
        } else {
            self.registry.generation()
        };
        let count = self.registry.snapshot().tool_count();

        let report = LoadReport::new(applied, count, generation);
        tracing::info!(
            files,
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            count = report.count,
            generation = report.generation,
            "catalog_reloaded"
        );

        if let Some(indexer) = &self.indexer {
            if report.added + report.updated > 0 {
                indexer.spawn_backfill();
            }
        }
        Ok(report)
    }

    async fn publish_from_store(&self) -> Result<u64> {
        let tools = self.store.load_tools().await?;
        let embeddings = self.store.load_embeddings().await?;
        let generation = self.registry.publish(tools, embeddings).generation();
        self.publish_pending.store(false, Ordering::Release);
        Ok(generation)
    }

    fn record(&self, result: &Result<LoadReport>) {
        if let Err(err) = result {
            tracing::error!(error = %err, "catalog reload failed, keeping previous snapshot");
        }
        if let Some(metrics) = &self.metrics {
            metrics.observe_reload(result.is_ok(), self.registry.generation());
        }
    }
}
