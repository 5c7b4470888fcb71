//! Hybrid selector.
//!
//! `score = α·cosine + β·keyword_overlap + γ·preference`, over the patterns
//! of latest, enabled tools in the current snapshot. Patterns without a
//! vector keep a zero vector term. Ordering for equal scores is fixed:
//! production-safe first, then cheaper, then tool name, then pattern key.

use crate::catalog::registry::CatalogRegistry;
use crate::catalog::snapshot::{matches_category, matches_platform, CatalogSnapshot};
use crate::embedding::SharedEmbedder;
use crate::metrics::{Outcome, ServiceMetrics};
use crate::selector::cache::{CacheKey, CacheStats, QueryCache};
use crate::selector::scoring::{cosine, keyword_overlap, normalize_query, preference_score, tokenize};
use crate::types::{Error, Result, ScoreWeights, SelectorConfig};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

/// One ranked pattern.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoredPattern {
    /// Tool name.
    pub name: String,
    pub version: String,
    pub platform: String,
    pub category: String,
    pub capability: String,
    pub pattern: String,
    pub pattern_key: String,
    pub description: String,
    pub score: f64,
    pub vector_score: f64,
    pub keyword_score: f64,
    pub preference_score: f64,
    pub production_safe: bool,
    pub cost: f64,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Arc<Vec<ScoredPattern>>,
    pub generation: u64,
    pub cached: bool,
    pub duration: Duration,
}

type RankedResults = Arc<Vec<ScoredPattern>>;

pub struct HybridSelector {
    registry: Arc<CatalogRegistry>,
    embedder: Option<SharedEmbedder>,
    config: SelectorConfig,
    cache: QueryCache<RankedResults>,
    metrics: Option<ServiceMetrics>,
}

impl std::fmt::Debug for HybridSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridSelector")
            .field("weights", &self.config.weights)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl HybridSelector {
    pub fn new(
        registry: Arc<CatalogRegistry>,
        embedder: Option<SharedEmbedder>,
        config: SelectorConfig,
        cache_size: usize,
    ) -> Self {
        Self {
            registry,
            embedder,
            config,
            cache: QueryCache::new(cache_size),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ServiceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome> {
        let started = Instant::now();
        let result = self.search_inner(request, started).await;
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(outcome) => {
                    metrics.observe_request("selector", Outcome::Success, outcome.duration);
                    if let Some(top) = outcome.results.first() {
                        metrics
                            .selections_total
                            .with_label_values(&[top.pattern_key.as_str()])
                            .inc();
                    }
                }
                Err(err) => {
                    metrics.observe_request("selector", Outcome::from_error(err), started.elapsed());
                    metrics.observe_error("selector", err.code());
                }
            }
        }
        result
    }

    async fn search_inner(&self, request: &SearchRequest, started: Instant) -> Result<SearchOutcome> {
        let query = normalize_query(&request.query);
        if query.is_empty() {
            return Err(Error::validation("query cannot be empty"));
        }
        let k = request
            .k
            .unwrap_or(self.config.default_k)
            .clamp(1, self.config.max_k.max(1));

        let snapshot = self.registry.snapshot();
        let generation = snapshot.generation();
        let key = CacheKey {
            query: query.clone(),
            k,
            platform: request.platform.as_deref().map(str::to_lowercase),
            category: request.category.as_deref().map(str::to_lowercase),
        };

        if let Some(results) = self.cache.get(generation, &key) {
            if let Some(metrics) = &self.metrics {
                metrics.cache_hits_total.inc();
            }
            return Ok(SearchOutcome {
                results,
                generation,
                cached: true,
                duration: started.elapsed(),
            });
        }
        if let Some(metrics) = &self.metrics {
            metrics.cache_misses_total.inc();
        }

        let query_vector = self.embed_query(&snapshot, &query).await;
        let results = Arc::new(rank(
            &snapshot,
            &self.config.weights,
            &query,
            query_vector.as_deref(),
            k,
            key.platform.as_deref(),
            key.category.as_deref(),
        ));
        self.cache.put(generation, key, results.clone());

        tracing::debug!(
            query = %query,
            k,
            generation,
            results = results.len(),
            "selector_search"
        );
        Ok(SearchOutcome {
            results,
            generation,
            cached: false,
            duration: started.elapsed(),
        })
    }

    /// Query vector, or None to score symbolically.
    async fn embed_query(&self, snapshot: &CatalogSnapshot, query: &str) -> Option<Vec<f32>> {
        let embedder = self.embedder.as_ref()?;
        if snapshot.embedded_count() == 0 || self.config.weights.vector == 0.0 {
            return None;
        }
        let texts = [query.to_string()];
        match tokio::time::timeout(self.config.embed_timeout, embedder.embed(&texts)).await {
            Ok(Ok(mut vectors)) if !vectors.is_empty() => Some(vectors.swap_remove(0)),
            Ok(Ok(_)) => None,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "query embedding failed, scoring symbolically");
                None
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.embed_timeout.as_millis() as u64,
                    "query embedding timed out, scoring symbolically"
                );
                None
            }
        }
    }
}

/// Score and order candidates of one snapshot. Pure, so identical inputs
/// produce identical output.
pub fn rank(
    snapshot: &CatalogSnapshot,
    weights: &ScoreWeights,
    normalized_query: &str,
    query_vector: Option<&[f32]>,
    k: usize,
    platform: Option<&str>,
    category: Option<&str>,
) -> Vec<ScoredPattern> {
    let query_tokens = tokenize(normalized_query);

    let mut scored: Vec<ScoredPattern> = snapshot
        .patterns()
        .iter()
        .filter(|entry| {
            entry.tool.enabled
                && entry.tool.is_latest
                && matches_platform(&entry.tool, platform)
                && matches_category(&entry.tool, category)
        })
        .filter_map(|entry| {
            let vector_score = match (query_vector, snapshot.embedding(&entry.key)) {
                (Some(q), Some(p)) => cosine(q, p).max(0.0),
                _ => 0.0,
            };
            let keyword_score = keyword_overlap(&query_tokens, &entry.tokens);
            if vector_score <= 0.0 && keyword_score <= 0.0 {
                return None;
            }
            let pattern = entry.pattern();
            let pref = preference_score(pattern);
            let score = weights.vector * vector_score
                + weights.keyword * keyword_score
                + weights.preference * pref;
            Some(ScoredPattern {
                name: entry.tool.name.clone(),
                version: entry.tool.version.clone(),
                platform: entry.tool.platform.clone(),
                category: entry.tool.category.clone(),
                capability: entry.capability().name.clone(),
                pattern: pattern.name.clone(),
                pattern_key: entry.key.clone(),
                description: pattern.description.clone(),
                score,
                vector_score,
                keyword_score,
                preference_score: pref,
                production_safe: pattern.policy.production_safe,
                cost: pattern.estimates.cost,
            })
        })
        .collect();

    scored.sort_by(compare_ranked);
    scored.truncate(k);
    scored
}

fn compare_ranked(a: &ScoredPattern, b: &ScoredPattern) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.production_safe.cmp(&a.production_safe))
        .then_with(|| a.cost.total_cmp(&b.cost))
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.pattern_key.cmp(&b.pattern_key))
}
