//! Immutable catalog snapshot.
//!
//! Built once per reload (or embedding publish) and shared behind an `Arc`.
//! Everything the selector needs per pattern is precomputed here so search
//! never touches the store.

use crate::catalog::model::{content_hash, pattern_key, Capability, Embedding, Pattern, Tool};
use crate::selector::scoring::tokenize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// One selectable pattern of a latest, enabled tool.
#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub key: String,
    pub tool: Arc<Tool>,
    cap_index: usize,
    pattern_index: usize,
    pub content_hash: String,
    /// Tokens of tool name, capability, description and use cases.
    pub tokens: HashSet<String>,
}

impl PatternEntry {
    pub fn capability(&self) -> &Capability {
        &self.tool.capabilities[self.cap_index]
    }

    pub fn pattern(&self) -> &Pattern {
        &self.capability().patterns[self.pattern_index]
    }
}

/// Consistent view of the catalog at one generation.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    generation: u64,
    tools: Vec<Arc<Tool>>,
    latest: BTreeMap<String, Arc<Tool>>,
    patterns: Vec<PatternEntry>,
    embeddings: HashMap<String, Arc<Embedding>>,
}

impl CatalogSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from every stored tool plus the stored embeddings. Only
    /// `enabled && is_latest` tools become selectable; embeddings whose hash
    /// no longer matches their pattern are dropped.
    pub fn build(generation: u64, tools: Vec<Tool>, embeddings: HashMap<String, Embedding>) -> Self {
        let tools: Vec<Arc<Tool>> = tools.into_iter().map(Arc::new).collect();
        let mut latest = BTreeMap::new();
        let mut patterns = Vec::new();

        for tool in tools.iter().filter(|t| t.enabled && t.is_latest) {
            latest.insert(tool.name.clone(), tool.clone());
            for (ci, cap) in tool.capabilities.iter().enumerate() {
                for (pi, pattern) in cap.patterns.iter().enumerate() {
                    let text = pattern.embedding_text(&tool.name, &cap.name);
                    let mut tokens = tokenize(&text);
                    tokens.extend(tokenize(&tool.description));
                    tokens.extend(tokenize(&cap.description));
                    patterns.push(PatternEntry {
                        key: pattern_key(&tool.name, &cap.name, &pattern.name),
                        tool: tool.clone(),
                        cap_index: ci,
                        pattern_index: pi,
                        content_hash: content_hash(&text),
                        tokens,
                    });
                }
            }
        }

        let embeddings = embeddings
            .into_iter()
            .map(|(k, v)| (k, Arc::new(v)))
            .collect();
        let mut snapshot = Self {
            generation,
            tools,
            latest,
            patterns,
            embeddings,
        };
        snapshot.drop_stale_embeddings();
        snapshot
    }

    /// Same tools, new vectors merged in, new generation.
    pub fn with_embeddings(&self, generation: u64, fresh: HashMap<String, Embedding>) -> Self {
        let mut embeddings = self.embeddings.clone();
        for (key, embedding) in fresh {
            embeddings.insert(key, Arc::new(embedding));
        }
        let mut snapshot = Self {
            generation,
            tools: self.tools.clone(),
            latest: self.latest.clone(),
            patterns: self.patterns.clone(),
            embeddings,
        };
        snapshot.drop_stale_embeddings();
        snapshot
    }

    fn drop_stale_embeddings(&mut self) {
        let current: HashMap<&str, &str> = self
            .patterns
            .iter()
            .map(|p| (p.key.as_str(), p.content_hash.as_str()))
            .collect();
        self.embeddings.retain(|key, e| {
            current.get(key.as_str()) == Some(&e.content_hash.as_str())
        });
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of selectable (latest, enabled) tools.
    pub fn tool_count(&self) -> usize {
        self.latest.len()
    }

    /// Every stored version, including disabled ones.
    pub fn all_tools(&self) -> &[Arc<Tool>] {
        &self.tools
    }

    pub fn patterns(&self) -> &[PatternEntry] {
        &self.patterns
    }

    pub fn latest_tool(&self, name: &str) -> Option<&Arc<Tool>> {
        self.latest.get(name)
    }

    pub fn embedding(&self, key: &str) -> Option<&[f32]> {
        self.embeddings.get(key).map(|e| e.vector.as_slice())
    }

    pub fn embedded_count(&self) -> usize {
        self.embeddings.len()
    }

    /// Latest enabled tools, sorted by name, filtered by platform/category.
    pub fn list(&self, platform: Option<&str>, category: Option<&str>) -> Vec<&Arc<Tool>> {
        self.latest
            .values()
            .filter(|t| matches_platform(t, platform) && matches_category(t, category))
            .collect()
    }

    /// Prompt listing of available tools, optionally restricted to `allowed`.
    pub fn render_prompt(&self, allowed: Option<&[String]>) -> String {
        self.latest
            .values()
            .filter(|t| allowed.map_or(true, |names| names.iter().any(|n| n == &t.name)))
            .map(|t| t.to_prompt_line())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `any`-platform tools match every platform filter.
pub fn matches_platform(tool: &Tool, platform: Option<&str>) -> bool {
    match platform {
        None => true,
        Some(p) => tool.platform.eq_ignore_ascii_case(p) || tool.platform == "any",
    }
}

pub fn matches_category(tool: &Tool, category: Option<&str>) -> bool {
    category.map_or(true, |c| tool.category.eq_ignore_ascii_case(c))
}
