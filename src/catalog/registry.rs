//! Live catalog registry.
//!
//! Readers load the current snapshot without locking; writers build a new
//! snapshot off to the side and swap the pointer. Writers are serialized so
//! generations are strictly increasing.

use crate::catalog::model::{Embedding, Tool};
use crate::catalog::snapshot::CatalogSnapshot;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug)]
pub struct CatalogRegistry {
    current: ArcSwap<CatalogSnapshot>,
    publish: Mutex<()>,
    reads: AtomicU64,
}

impl Default for CatalogRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(CatalogSnapshot::empty()),
            publish: Mutex::new(()),
            reads: AtomicU64::new(0),
        }
    }

    /// Current snapshot. Holding the `Arc` pins that generation.
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation()
    }

    /// Reads served from memory since start.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Replace the whole catalog.
    pub fn publish(
        &self,
        tools: Vec<Tool>,
        embeddings: HashMap<String, Embedding>,
    ) -> Arc<CatalogSnapshot> {
        let _guard = self.publish.lock().unwrap_or_else(|p| p.into_inner());
        let generation = self.current.load().generation() + 1;
        let next = Arc::new(CatalogSnapshot::build(generation, tools, embeddings));
        self.current.store(next.clone());
        tracing::info!(
            generation,
            tools = next.tool_count(),
            patterns = next.patterns().len(),
            "catalog_snapshot_published"
        );
        next
    }

    /// Merge freshly computed vectors into the current catalog.
    pub fn publish_embeddings(&self, fresh: HashMap<String, Embedding>) -> Arc<CatalogSnapshot> {
        let _guard = self.publish.lock().unwrap_or_else(|p| p.into_inner());
        let current = self.current.load_full();
        let next = Arc::new(current.with_embeddings(current.generation() + 1, fresh));
        self.current.store(next.clone());
        tracing::debug!(
            generation = next.generation(),
            embedded = next.embedded_count(),
            "catalog_embeddings_published"
        );
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::tests::sample_tool;

    #[test]
    fn test_publish_bumps_generation() {
        let registry = CatalogRegistry::new();
        assert_eq!(registry.generation(), 0);

        let mut tool = sample_tool();
        tool.is_latest = true;
        registry.publish(vec![tool], HashMap::new());
        assert_eq!(registry.generation(), 1);
        registry.publish_embeddings(HashMap::new());
        assert_eq!(registry.generation(), 2);
        assert_eq!(registry.snapshot().tool_count(), 1);
    }

    #[test]
    fn test_held_snapshot_unaffected_by_swap() {
        let registry = CatalogRegistry::new();
        let mut tool = sample_tool();
        tool.is_latest = true;
        registry.publish(vec![tool], HashMap::new());

        let held = registry.snapshot();
        registry.publish(vec![], HashMap::new());

        assert_eq!(held.tool_count(), 1);
        assert_eq!(held.generation(), 1);
        assert_eq!(registry.snapshot().tool_count(), 0);
    }
}
