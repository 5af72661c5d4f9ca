//! Score utilities (C1): per-query min-max normalization, the sigmoid-based
//! "strong signal" detector, RRF contribution math, and the deterministic
//! tie-break key shared by every sort in the pipeline.

/// Min-max normalize raw scores into `[0, 1]`, treating the most negative
/// value as "best" (the FTS5 BM25 convention: lower raw score is a better
/// match). If the range collapses below `1e-9`, every value normalizes to 1.
pub fn normalize_bm25(raw_scores: &[f64]) -> Vec<f64> {
    if raw_scores.is_empty() {
        return Vec::new();
    }
    let best = raw_scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let worst = raw_scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (worst - best).abs() < 1e-9 {
        return vec![1.0; raw_scores.len()];
    }
    raw_scores
        .iter()
        .map(|s| ((worst - s) / (worst - best)).clamp(0.0, 1.0))
        .collect()
}

/// Plain min-max normalization where higher raw score is better (used for
/// rerank scores and for fusion score normalization in C8). All-equal input
/// normalizes to 1.
pub fn normalize_minmax(raw_scores: &[f64]) -> Vec<f64> {
    if raw_scores.is_empty() {
        return Vec::new();
    }
    let min = raw_scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = raw_scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if (max - min).abs() < 1e-9 {
        return vec![1.0; raw_scores.len()];
    }
    raw_scores
        .iter()
        .map(|s| ((s - min) / (max - min)).clamp(0.0, 1.0))
        .collect()
}

/// Map cosine distance to a similarity score in `[0, 1]` via `1 - d/2`.
pub fn normalize_cosine_distance(distance: f64) -> f64 {
    (1.0 - distance / 2.0).clamp(0.0, 1.0)
}

/// Auxiliary "strong signal" normalization: `sigmoid((|s| - center) / scale)`.
/// Used over the top-k raw BM25 scores to decide whether expansion can be skipped.
pub fn sigmoid_strength(raw_score: f64, center: f64, scale: f64) -> f64 {
    let x = (raw_score.abs() - center) / scale;
    1.0 / (1.0 + (-x).exp())
}

/// RRF contribution for rank `r` (1-based), constant `k`, weight `w`.
pub fn rrf_contribution(k: f64, rank: usize, weight: f64) -> f64 {
    weight / (k + rank as f64)
}

/// Deterministic tie-break key: ascending `"mirror_hash:seq"` lexicographic order.
pub fn tie_break_key(mirror_hash: &str, seq: i64) -> String {
    format!("{mirror_hash}:{seq}")
}

/// Compare two `(score, mirror_hash, seq)` triples the way every sort in the
/// pipeline must: descending score, then ascending tie-break key.
pub fn deterministic_cmp(
    score_a: f64,
    key_a: &str,
    score_b: f64,
    key_b: &str,
) -> std::cmp::Ordering {
    score_b
        .partial_cmp(&score_a)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| key_a.cmp(key_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_bm25_single() {
        assert_eq!(normalize_bm25(&[-3.2]), vec![1.0]);
    }

    #[test]
    fn test_normalize_bm25_most_negative_is_best() {
        // FTS5 convention: lower (more negative) raw score is the better match.
        let result = normalize_bm25(&[-5.0, -1.0, -3.0]);
        assert!((result[0] - 1.0).abs() < 1e-9);
        assert!((result[1] - 0.0).abs() < 1e-9);
        assert!((result[2] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_bm25_all_equal() {
        let result = normalize_bm25(&[-2.0, -2.0, -2.0]);
        for v in result {
            assert!((v - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_normalize_bm25_empty() {
        assert!(normalize_bm25(&[]).is_empty());
    }

    #[test]
    fn test_normalize_bm25_always_in_unit_range() {
        let result = normalize_bm25(&[-100.0, 3.0, -0.5, 42.0]);
        for v in result {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_normalize_minmax_range_has_zero_and_one() {
        let result = normalize_minmax(&[10.0, 0.0, 5.0]);
        assert!((result.iter().cloned().fold(f64::INFINITY, f64::min) - 0.0).abs() < 1e-9);
        assert!((result.iter().cloned().fold(f64::NEG_INFINITY, f64::max) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_normalize_cosine_distance_bounds() {
        assert!((normalize_cosine_distance(0.0) - 1.0).abs() < 1e-9);
        assert!((normalize_cosine_distance(2.0) - 0.0).abs() < 1e-9);
        assert_eq!(normalize_cosine_distance(3.0), 0.0);
        assert_eq!(normalize_cosine_distance(-1.0), 1.0);
    }

    #[test]
    fn test_rrf_contribution_monotonic_in_rank() {
        let r1 = rrf_contribution(60.0, 1, 1.0);
        let r2 = rrf_contribution(60.0, 2, 1.0);
        assert!(r1 > r2);
    }

    #[test]
    fn test_rrf_contribution_scales_with_weight() {
        let w1 = rrf_contribution(60.0, 5, 1.0);
        let w2 = rrf_contribution(60.0, 5, 2.0);
        assert!((w2 - 2.0 * w1).abs() < 1e-12);
    }

    #[test]
    fn test_tie_break_key_format() {
        assert_eq!(tie_break_key("abc123", 7), "abc123:7");
    }

    #[test]
    fn test_deterministic_cmp_orders_by_score_desc_then_key_asc() {
        assert_eq!(
            deterministic_cmp(0.9, "b:1", 0.5, "a:1"),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            deterministic_cmp(0.5, "b:1", 0.5, "a:1"),
            std::cmp::Ordering::Greater
        );
    }
}
