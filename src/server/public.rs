//! Public gateway routes: catalog, selector, execution, stats and metrics.
//!
//! Nothing under `/internal` is routed here; those paths fall through to 404.

use super::error::ApiError;
use super::AppState;
use crate::catalog::model::Tool;
use crate::execution::{ExecuteRequest, ExecutionResponse};
use crate::selector::{CacheStats, ScoredPattern, SearchRequest};
use crate::storage::PoolStats;
use crate::types::{Error, TraceId};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/ai/tools/list", get(list_tools))
        .route("/ai/tools/execute", post(execute))
        .route("/ai/tools/reload", post(reload))
        .route("/ai/tools/prompt", get(prompt))
        .route("/ai/tools/embeddings/backfill", post(backfill))
        .route("/api/selector/search", get(search_query).post(search_body))
        .route("/api/selector/performance/stats", get(performance_stats))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.registry.snapshot();
    Json(json!({
        "status": "ok",
        "generation": snapshot.generation(),
        "tools": snapshot.tool_count(),
    }))
}

async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let body = state.metrics.export()?;
    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

// =============================================================================
// Catalog
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    platform: Option<String>,
    category: Option<String>,
}

#[derive(Debug, Serialize)]
struct ToolSummary {
    name: String,
    version: String,
    platform: String,
    category: String,
    description: String,
    execution_method: &'static str,
    auth: bool,
    capabilities: Vec<String>,
}

impl From<&Tool> for ToolSummary {
    fn from(tool: &Tool) -> Self {
        Self {
            name: tool.name.clone(),
            version: tool.version.clone(),
            platform: tool.platform.clone(),
            category: tool.category.clone(),
            description: tool.description.clone(),
            execution_method: tool.execution_method.as_str(),
            auth: tool.metadata.requires_auth,
            capabilities: tool.capabilities.iter().map(|c| c.name.clone()).collect(),
        }
    }
}

async fn list_tools(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<serde_json::Value> {
    let snapshot = state.registry.snapshot();
    let tools: Vec<ToolSummary> = snapshot
        .list(query.platform.as_deref(), query.category.as_deref())
        .into_iter()
        .map(|t| ToolSummary::from(&**t))
        .collect();
    Json(json!({
        "total": tools.len(),
        "generation": snapshot.generation(),
        "tools": tools,
    }))
}

async fn reload(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state
        .loader
        .reload()
        .await
        .map_err(|e| ApiError::new(e, &trace_id))?;
    Ok(Json(json!({
        "success": true,
        "count": report.count,
        "added": report.added,
        "updated": report.updated,
        "removed": report.removed,
        "generation": report.generation,
    })))
}

#[derive(Debug, Default, Deserialize)]
struct PromptQuery {
    /// Comma-separated tool names.
    tools: Option<String>,
}

async fn prompt(State(state): State<AppState>, Query(query): Query<PromptQuery>) -> String {
    let allowed: Option<Vec<String>> = query.tools.map(|list| {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    });
    state.registry.snapshot().render_prompt(allowed.as_deref())
}

#[derive(Debug, Default, Deserialize)]
struct BackfillRequest {
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    all: bool,
}

async fn backfill(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let request: BackfillRequest = if body.is_empty() {
        BackfillRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::new(Error::validation(e.to_string()), &trace_id))?
    };
    let indexer = state
        .indexer
        .as_ref()
        .ok_or_else(|| ApiError::new(Error::not_found("no embedding provider configured"), &trace_id))?;
    let report = indexer
        .backfill(request.filter.as_deref(), request.all)
        .await
        .map_err(|e| ApiError::new(e, &trace_id))?;
    Ok(Json(json!({ "success": true, "report": report })))
}

// =============================================================================
// Execution
// =============================================================================

/// Always 200; failures are reported in the body.
async fn execute(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    body: Bytes,
) -> Json<ExecutionResponse> {
    let started = Instant::now();
    match serde_json::from_slice::<ExecuteRequest>(&body) {
        Ok(request) => Json(state.proxy.execute(request, trace_id).await),
        Err(err) => {
            let tool = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("name").and_then(|n| n.as_str()).map(str::to_string))
                .unwrap_or_default();
            let err = Error::validation(format!("malformed execute request: {}", err));
            tracing::warn!(trace_id = %trace_id, error = %err, "execute rejected");
            Json(ExecutionResponse::failure(tool, &err, started.elapsed(), &trace_id))
        }
    }
}

// =============================================================================
// Selector
// =============================================================================

#[derive(Debug, Serialize)]
struct SearchResponse {
    results: Arc<Vec<ScoredPattern>>,
    total: usize,
    cached: bool,
    generation: u64,
    trace_id: String,
    duration_ms: f64,
}

async fn run_search(
    state: &AppState,
    request: SearchRequest,
    trace_id: &TraceId,
) -> Result<Json<SearchResponse>, ApiError> {
    let outcome = state
        .selector
        .search(&request)
        .await
        .map_err(|e| ApiError::new(e, trace_id))?;
    tracing::info!(
        trace_id = %trace_id,
        results = outcome.results.len(),
        cached = outcome.cached,
        "search served"
    );
    Ok(Json(SearchResponse {
        total: outcome.results.len(),
        results: outcome.results,
        cached: outcome.cached,
        generation: outcome.generation,
        trace_id: trace_id.to_string(),
        duration_ms: outcome.duration.as_secs_f64() * 1000.0,
    }))
}

async fn search_query(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    Query(request): Query<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    run_search(&state, request, &trace_id).await
}

async fn search_body(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    body: Bytes,
) -> Result<Json<SearchResponse>, ApiError> {
    let request: SearchRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::new(Error::validation(e.to_string()), &trace_id))?;
    run_search(&state, request, &trace_id).await
}

#[derive(Debug, Serialize)]
struct PerformanceStats {
    connection_pool: PoolStats,
    cache: CacheStats,
    database: DatabaseStats,
}

#[derive(Debug, Serialize)]
struct DatabaseStats {
    /// Catalog reads served from the in-memory snapshot rather than SQLite.
    cache_hit_ratio: f64,
    snapshot_reads: u64,
    store_queries: u64,
    generation: u64,
}

async fn performance_stats(State(state): State<AppState>) -> Json<PerformanceStats> {
    let reads = state.registry.read_count();
    let queries = state.store.query_count();
    let total = reads + queries;
    Json(PerformanceStats {
        connection_pool: state.store.pool_stats(),
        cache: state.selector.cache_stats(),
        database: DatabaseStats {
            cache_hit_ratio: if total == 0 {
                1.0
            } else {
                reads as f64 / total as f64
            },
            snapshot_reads: reads,
            store_queries: queries,
            generation: state.registry.generation(),
        },
    })
}
