//! Scoring primitives for hybrid selection.

use crate::catalog::model::{Pattern, Preferences};
use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "for", "from", "how", "i", "in",
    "is", "it", "me", "my", "of", "on", "or", "show", "that", "the", "this", "to", "what", "which",
    "with",
];

/// Penalty subtracted from the preference score of patterns that need approval.
pub const APPROVAL_PENALTY: f64 = 0.25;

/// Lowercase, collapse whitespace, trim.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Alphanumeric tokens, lowercased, stopwords and single characters removed.
pub fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .filter(|t| !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Fraction of query tokens present in the candidate's tokens.
pub fn keyword_overlap(query: &HashSet<String>, candidate: &HashSet<String>) -> f64 {
    if query.is_empty() {
        return 0.0;
    }
    let shared = query.intersection(candidate).count();
    shared as f64 / query.len() as f64
}

/// Cosine similarity; 0 for empty, mismatched or zero-norm vectors.
pub fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Mean preference weight, minus a penalty for approval-gated patterns.
/// Clamped to `[0, 1]`.
pub fn preference_score(pattern: &Pattern) -> f64 {
    let Preferences {
        cost,
        speed,
        accuracy,
        complexity,
        completeness,
    } = pattern.preferences;
    let mean = (cost + speed + accuracy + complexity + completeness) / 5.0;
    let penalty = if pattern.policy.requires_approval {
        APPROVAL_PENALTY
    } else {
        0.0
    };
    (mean - penalty).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::model::tests::sample_tool;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_query("  Check   DISK\tspace "), "check disk space");
    }

    #[test]
    fn test_tokenize_drops_stopwords() {
        let tokens = tokenize("Show me the disk usage on db01");
        let mut sorted: Vec<_> = tokens.into_iter().collect();
        sorted.sort();
        assert_eq!(sorted, vec!["db01", "disk", "usage"]);
    }

    #[test]
    fn test_keyword_overlap_fraction() {
        let q = tokenize("disk space report");
        let c = tokenize("report free disk capacity");
        assert!((keyword_overlap(&q, &c) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(keyword_overlap(&HashSet::new(), &c), 0.0);
    }

    #[test]
    fn test_cosine_edge_cases() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert_eq!(cosine(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine(&[], &[]), 0.0);
    }

    #[test]
    fn test_preference_penalizes_approval() {
        let tool = sample_tool();
        let mut pattern = tool.capabilities[0].patterns[0].clone();
        let base = preference_score(&pattern);
        assert!((base - 0.5).abs() < 1e-9);
        pattern.policy.requires_approval = true;
        assert!((preference_score(&pattern) - 0.25).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_cosine_bounded(
            a in prop::collection::vec(-100.0f32..100.0, 8),
            b in prop::collection::vec(-100.0f32..100.0, 8),
        ) {
            let c = cosine(&a, &b);
            prop_assert!((-1.0 - 1e-6..=1.0 + 1e-6).contains(&c));
        }

        #[test]
        fn prop_overlap_bounded(q in "[a-z ]{0,40}", d in "[a-z ]{0,80}") {
            let o = keyword_overlap(&tokenize(&q), &tokenize(&d));
            prop_assert!((0.0..=1.0).contains(&o));
        }

        #[test]
        fn prop_normalize_idempotent(q in "[A-Za-z0-9 \\t]{0,60}") {
            let once = normalize_query(&q);
            prop_assert_eq!(normalize_query(&once), once.clone());
        }
    }
}
