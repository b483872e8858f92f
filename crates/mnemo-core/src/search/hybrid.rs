//! Rank fusion
//!
//! Reciprocal Rank Fusion for combining keyword and vector result lists.
//! RRF normalizes across the incompatible score scales of BM25 and cosine
//! similarity and rewards records surfaced by both retrievers.

use std::collections::HashMap;

/// Default RRF dampening constant
pub const DEFAULT_RRF_K: f32 = 60.0;

/// Reciprocal Rank Fusion over two ranked id lists.
///
/// `score(d) = Σ 1 / (k + rank(d))` across the lists a record appears in.
/// Input lists must already be sorted best-first; returned pairs are sorted
/// by fused score descending.
pub fn reciprocal_rank_fusion(
    keyword_results: &[(String, f32)],
    vector_results: &[(String, f32)],
    k: f32,
) -> Vec<(String, f32)> {
    let mut scores: HashMap<String, f32> = HashMap::new();

    for (rank, (key, _)) in keyword_results.iter().enumerate() {
        *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32);
    }
    for (rank, (key, _)) in vector_results.iter().enumerate() {
        *scores.entry(key.clone()).or_default() += 1.0 / (k + rank as f32);
    }

    let mut results: Vec<(String, f32)> = scores.into_iter().collect();
    results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    results
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rrf_rewards_overlap() {
        let keyword = vec![
            ("doc-1".to_string(), 9.0),
            ("doc-2".to_string(), 7.0),
            ("doc-3".to_string(), 5.0),
        ];
        let vector = vec![
            ("doc-2".to_string(), 0.95),
            ("doc-4".to_string(), 0.80),
        ];

        let fused = reciprocal_rank_fusion(&keyword, &vector, DEFAULT_RRF_K);
        // doc-2 appears in both lists and must rank first
        assert_eq!(fused[0].0, "doc-2");
        for pair in fused.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_rrf_with_one_empty_side() {
        let keyword: Vec<(String, f32)> = vec![];
        let vector = vec![("doc-1".to_string(), 0.9)];
        let fused = reciprocal_rank_fusion(&keyword, &vector, DEFAULT_RRF_K);
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].0, "doc-1");
    }

    #[test]
    fn test_rrf_score_formula() {
        let keyword = vec![("doc-1".to_string(), 1.0)];
        let vector = vec![("doc-1".to_string(), 1.0)];
        let fused = reciprocal_rank_fusion(&keyword, &vector, 60.0);
        assert!((fused[0].1 - 2.0 / 60.0).abs() < 1e-6);
    }
}
