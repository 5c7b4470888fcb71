//! Hybrid (vector + symbolic) tool selection with a bounded result cache.

pub mod cache;
pub mod engine;
pub mod scoring;

pub use cache::{CacheKey, CacheStats, QueryCache};
pub use engine::{rank, HybridSelector, ScoredPattern, SearchOutcome, SearchRequest};
pub use scoring::{cosine, keyword_overlap, normalize_query, preference_score, tokenize};
