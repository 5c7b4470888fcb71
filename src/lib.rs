//! # Toolhub Core - Tool Catalog & Hybrid Selection/Execution Runtime
//!
//! Turns a natural-language operator request into a concrete, safely
//! executed system action:
//! - Versioned tool catalog stored in SQLite, hot-reloaded from YAML
//!   definitions with an atomic snapshot swap
//! - Hybrid selector (embedding cosine + keyword overlap + preference) with a
//!   generation-aware LRU cache
//! - Execution proxy that resolves the target asset and its credentials
//!   before dispatching to a runner under a hard deadline
//! - Secrets broker reachable only on the internal listener
//! - Prometheus metrics and a release gate that polls them
//!
//! ## Architecture
//!
//! ```text
//!   definitions/*.yaml ─→ CatalogLoader ─→ CatalogStore (SQLite, pooled)
//!                              │                 ↑
//!                              ↓                 │ vectors
//!                       CatalogRegistry ←── EmbeddingIndexer
//!                      (ArcSwap snapshot)
//!                        ↙          ↘
//!              HybridSelector    ExecutionProxy ─→ AssetResolver
//!               (QueryCache)          │        ─→ SecretsBroker
//!                                     ↓
//!                               RunnerRegistry
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod assets;
pub mod catalog;
pub mod embedding;
pub mod execution;
pub mod gate;
pub mod metrics;
pub mod retry;
pub mod runtime;
pub mod secrets;
pub mod selector;
pub mod server;
pub mod storage;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
