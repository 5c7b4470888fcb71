//! Embedding backfill.
//!
//! Finds patterns whose stored vector is missing or was computed from other
//! text, embeds them in batches, and republishes the live snapshot with the
//! new vectors. Batches that keep failing are flagged stale in the store and
//! those patterns score symbolically until a later backfill succeeds.

use crate::catalog::model::{Embedding, PatternText};
use crate::catalog::registry::CatalogRegistry;
use crate::embedding::SharedEmbedder;
use crate::retry::{with_retry, RetryPolicy};
use crate::storage::CatalogStore;
use crate::types::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of one backfill run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub indexed: usize,
    /// Patterns already up to date.
    pub skipped: usize,
    pub failed: usize,
}

pub struct EmbeddingIndexer {
    store: Arc<CatalogStore>,
    registry: Arc<CatalogRegistry>,
    provider: SharedEmbedder,
    batch_size: usize,
    retry: RetryPolicy,
    running: Mutex<()>,
}

impl std::fmt::Debug for EmbeddingIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingIndexer")
            .field("model", &self.provider.model_id())
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl EmbeddingIndexer {
    pub fn new(
        store: Arc<CatalogStore>,
        registry: Arc<CatalogRegistry>,
        provider: SharedEmbedder,
        batch_size: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            provider,
            batch_size: batch_size.max(1),
            retry,
            running: Mutex::new(()),
        }
    }

    pub fn provider(&self) -> &SharedEmbedder {
        &self.provider
    }

    /// Embed stale patterns (or every pattern with `all`), optionally only
    /// those whose key starts with `filter`. Runs are serialized.
    pub async fn backfill(&self, filter: Option<&str>, all: bool) -> Result<IndexReport> {
        let _running = self.running.lock().await;
        let filter = filter.map(str::to_string);

        let pending = self
            .store
            .patterns_needing_embedding(all, filter.clone())
            .await?;
        let total = self
            .store
            .patterns_needing_embedding(true, filter)
            .await?
            .len();

        let mut report = IndexReport {
            skipped: total.saturating_sub(pending.len()),
            ..IndexReport::default()
        };
        if pending.is_empty() {
            tracing::debug!(skipped = report.skipped, "embeddings up to date");
            return Ok(report);
        }

        let model = self.provider.model_id().to_string();
        let mut fresh = HashMap::new();

        for batch in pending.chunks(self.batch_size) {
            match self.embed_batch(batch).await {
                Ok(vectors) => {
                    for (pattern, vector) in batch.iter().zip(vectors) {
                        let embedding = Embedding {
                            pattern_key: pattern.pattern_key.clone(),
                            model: model.clone(),
                            content_hash: pattern.content_hash.clone(),
                            vector,
                            indexed_at: Utc::now(),
                        };
                        self.store.save_embedding(embedding.clone()).await?;
                        fresh.insert(embedding.pattern_key.clone(), embedding);
                        report.indexed += 1;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        batch = batch.len(),
                        error = %err,
                        "embedding batch failed, patterns flagged stale"
                    );
                    for pattern in batch {
                        self.store
                            .mark_embedding_failed(pattern.clone(), model.clone(), err.to_string())
                            .await?;
                    }
                    report.failed += batch.len();
                }
            }
        }

        if !fresh.is_empty() {
            self.registry.publish_embeddings(fresh);
        }
        tracing::info!(
            indexed = report.indexed,
            skipped = report.skipped,
            failed = report.failed,
            model = %model,
            "embedding backfill finished"
        );
        Ok(report)
    }

    async fn embed_batch(&self, batch: &[PatternText]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
        with_retry(&self.retry, "embedding", || {
            let provider = self.provider.clone();
            let texts = texts.clone();
            async move {
                let vectors = provider.embed(&texts).await?;
                if vectors.len() != texts.len() {
                    return Err(Error::upstream(format!(
                        "provider returned {} vectors for {} inputs",
                        vectors.len(),
                        texts.len()
                    )));
                }
                Ok(vectors)
            }
        })
        .await
    }

    /// Backfill changed patterns in the background.
    pub fn spawn_backfill(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let indexer = self.clone();
        tokio::spawn(async move {
            if let Err(err) = indexer.backfill(None, false).await {
                tracing::error!(error = %err, "background embedding backfill failed");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::tests::sample_tool;
    use crate::embedding::{EmbeddingProvider, HashingEmbedder};
    use crate::types::{Error, PoolConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FailingProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingProvider for FailingProvider {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::upstream("provider unavailable"))
        }

        fn model_id(&self) -> &str {
            "failing"
        }
    }

    /// Answers every batch with one vector too few.
    struct ShortProvider;

    #[async_trait]
    impl EmbeddingProvider for ShortProvider {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(vec![vec![1.0; 4]; texts.len().saturating_sub(1)])
        }

        fn model_id(&self) -> &str {
            "short"
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        }
    }

    async fn setup() -> (tempfile::TempDir, Arc<CatalogStore>, Arc<CatalogRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            CatalogStore::open(dir.path().join("c.db"), PoolConfig::default())
                .await
                .unwrap(),
        );
        store.apply_definitions(vec![sample_tool()]).await.unwrap();
        let registry = Arc::new(CatalogRegistry::new());
        registry.publish(store.load_tools().await.unwrap(), HashMap::new());
        (dir, store, registry)
    }

    #[tokio::test]
    async fn test_backfill_is_idempotent() {
        let (_dir, store, registry) = setup().await;
        let indexer = EmbeddingIndexer::new(
            store.clone(),
            registry.clone(),
            Arc::new(HashingEmbedder::new(32)),
            8,
            fast_retry(),
        );

        let first = indexer.backfill(None, false).await.unwrap();
        assert_eq!(first, IndexReport { indexed: 1, skipped: 0, failed: 0 });
        assert_eq!(registry.snapshot().embedded_count(), 1);
        assert_eq!(registry.generation(), 2);

        let second = indexer.backfill(None, false).await.unwrap();
        assert_eq!(second, IndexReport { indexed: 0, skipped: 1, failed: 0 });
        assert_eq!(registry.generation(), 2);

        let forced = indexer.backfill(None, true).await.unwrap();
        assert_eq!(forced.indexed, 1);
    }

    #[tokio::test]
    async fn test_provider_failure_flags_stale_without_error() {
        let (_dir, store, registry) = setup().await;
        let provider = Arc::new(FailingProvider {
            calls: AtomicU32::new(0),
        });
        let indexer =
            EmbeddingIndexer::new(store.clone(), registry.clone(), provider.clone(), 8, fast_retry());

        let report = indexer.backfill(None, false).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.stale_embeddings().await.unwrap().len(), 1);
        assert_eq!(registry.snapshot().embedded_count(), 0);
    }

    #[tokio::test]
    async fn test_short_batch_flags_every_pattern() {
        let (_dir, store, registry) = setup().await;
        let indexer =
            EmbeddingIndexer::new(store.clone(), registry.clone(), Arc::new(ShortProvider), 8, fast_retry());

        let report = indexer.backfill(None, false).await.unwrap();
        assert_eq!(report, IndexReport { indexed: 0, skipped: 0, failed: 1 });
        assert_eq!(store.stale_embeddings().await.unwrap().len(), 1);
        assert_eq!(registry.snapshot().embedded_count(), 0);
    }

    #[tokio::test]
    async fn test_filter_limits_backfill() {
        let (_dir, store, registry) = setup().await;
        let indexer = EmbeddingIndexer::new(
            store,
            registry,
            Arc::new(HashingEmbedder::new(32)),
            8,
            fast_retry(),
        );
        let report = indexer.backfill(Some("other_tool/"), false).await.unwrap();
        assert_eq!(report, IndexReport::default());
    }
}
