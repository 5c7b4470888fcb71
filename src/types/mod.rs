//! Core types for the tool runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (TraceId, JobId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for every subsystem

mod config;
mod errors;
mod ids;

pub use config::{
    AssetsConfig, CacheConfig, CatalogConfig, Config, EmbeddingConfig, ExecutionConfig,
    GateConfig, JobsConfig, ObservabilityConfig, PoolConfig, ScoreWeights, SecretsConfig,
    SelectorConfig, ServerConfig,
};
pub use errors::{DefinitionError, Error, Result};
pub use ids::{JobId, TraceId};
