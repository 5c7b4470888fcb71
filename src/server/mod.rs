//! HTTP surface.
//!
//! Two routers over one shared state. The public router is what the gateway
//! exposes; the internal router carries only the secrets broker and is bound
//! on a separate, service-to-service address. The secrets paths are absent
//! from the public router, so a gateway-routed call gets 404 rather than an
//! access check.

mod error;
mod internal;
mod public;
mod trace;

pub use error::ApiError;
pub use trace::TRACE_HEADER;

use crate::catalog::{CatalogLoader, CatalogRegistry};
use crate::embedding::EmbeddingIndexer;
use crate::execution::ExecutionProxy;
use crate::metrics::ServiceMetrics;
use crate::secrets::SecretsBroker;
use crate::selector::HybridSelector;
use crate::storage::CatalogStore;
use crate::types::{Error, Result, ServerConfig};
use axum::middleware;
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Everything the handlers need. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CatalogRegistry>,
    pub store: Arc<CatalogStore>,
    pub loader: Arc<CatalogLoader>,
    pub selector: Arc<HybridSelector>,
    pub proxy: Arc<ExecutionProxy>,
    pub broker: Arc<SecretsBroker>,
    pub indexer: Option<Arc<EmbeddingIndexer>>,
    pub metrics: ServiceMetrics,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("generation", &self.registry.generation())
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

fn with_tracing(router: Router<AppState>, state: AppState) -> Router {
    router
        .layer(TraceLayer::new_for_http().make_span_with(trace::request_span))
        .layer(middleware::from_fn(trace::propagate_trace_id))
        .with_state(state)
}

/// Gateway-facing routes.
pub fn public_router(state: AppState) -> Router {
    with_tracing(public::routes(), state)
}

/// Internal-network routes (secrets broker only).
pub fn internal_router(state: AppState) -> Router {
    with_tracing(internal::routes(), state)
}

/// Serve both listeners until `shutdown` fires.
pub async fn serve(state: AppState, config: &ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let public = tokio::net::TcpListener::bind(config.public_addr.as_str()).await?;
    let internal = tokio::net::TcpListener::bind(config.internal_addr.as_str()).await?;
    tracing::info!(
        public = %config.public_addr,
        internal = %config.internal_addr,
        "listening"
    );

    let public_server = axum::serve(public, public_router(state.clone()))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let internal_server = axum::serve(internal, internal_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned());

    tokio::try_join!(
        async { public_server.await.map_err(Error::from) },
        async { internal_server.await.map_err(Error::from) },
    )?;
    tracing::info!("listeners stopped");
    Ok(())
}
