//! Service-to-service routes. Bound only on the internal listener.

use super::error::ApiError;
use super::AppState;
use crate::secrets::remote::INTERNAL_KEY_HEADER;
use crate::secrets::{ImportReport, ResolvedCredential};
use crate::types::{Error, TraceId};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::Deserialize;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/internal/secrets/credential-lookup", post(credential_lookup))
        .route("/internal/secrets/import-from-assets", post(import_from_assets))
}

#[derive(Debug, Deserialize)]
struct LookupRequest {
    host: String,
    purpose: String,
}

fn authorize(state: &AppState, headers: &HeaderMap, trace_id: &TraceId) -> Result<(), ApiError> {
    let provided = headers
        .get(INTERNAL_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    state.broker.authorize(provided).map_err(|e| {
        tracing::warn!(trace_id = %trace_id, "secrets call rejected");
        ApiError::new(e, trace_id)
    })
}

async fn credential_lookup(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ResolvedCredential>, ApiError> {
    // Key check comes before the body is even parsed.
    authorize(&state, &headers, &trace_id)?;
    let request: LookupRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::new(Error::validation(e.to_string()), &trace_id))?;
    let credential = state
        .broker
        .credential_lookup(&request.host, &request.purpose)
        .await
        .map_err(|e| ApiError::new(e, &trace_id))?;
    Ok(Json(credential))
}

async fn import_from_assets(
    State(state): State<AppState>,
    Extension(trace_id): Extension<TraceId>,
    headers: HeaderMap,
) -> Result<Json<ImportReport>, ApiError> {
    authorize(&state, &headers, &trace_id)?;
    let report = state
        .broker
        .import_from_assets()
        .await
        .map_err(|e| ApiError::new(e, &trace_id))?;
    Ok(Json(report))
}
