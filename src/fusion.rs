//! Fusion (C7): weighted, tiered Reciprocal Rank Fusion over multiple ranked
//! lists tagged by retrieval source, with a deterministic tie-break.

use std::collections::HashMap;

use crate::config::RetrievalConfig;
use crate::models::{FusionCandidate, RankedChunkId, RetrievalSource};
use crate::score::{rrf_contribution, tie_break_key};

/// One source's contribution to fusion: its tag and the ranked ids it produced.
pub struct RankedList {
    pub source: RetrievalSource,
    pub ranked: Vec<RankedChunkId>,
}

fn source_weight(source: RetrievalSource, w_bm25: f64, w_vec: f64) -> f64 {
    match source {
        RetrievalSource::Bm25 => 2.0 * w_bm25,
        RetrievalSource::Bm25Variant => 0.5 * w_bm25,
        RetrievalSource::Vector => 2.0 * w_vec,
        RetrievalSource::VectorVariant => 0.5 * w_vec,
        RetrievalSource::Hyde => 0.7 * w_vec,
    }
}

struct Accumulator {
    mirror_hash: String,
    seq: i64,
    score: f64,
    bm25_rank: Option<usize>,
    vec_rank: Option<usize>,
    sources: Vec<RetrievalSource>,
    best_rank_anywhere: usize,
}

/// Fuse multiple ranked lists into a deterministic, deduplicated candidate set.
///
/// Order of `lists` does not affect any candidate's score (fusion is
/// commutative over same-tagged inputs); it only affects nothing observable
/// here since contributions are summed per candidate regardless of input order.
pub fn fuse(lists: &[RankedList], config: &RetrievalConfig) -> Vec<FusionCandidate> {
    let mut acc: HashMap<(String, i64), Accumulator> = HashMap::new();

    for list in lists {
        let weight = source_weight(list.source, config.w_bm25, config.w_vec);
        for ranked in &list.ranked {
            let key = (ranked.mirror_hash.clone(), ranked.seq);
            let contribution = rrf_contribution(config.rrf_k, ranked.rank, weight);

            let entry = acc.entry(key).or_insert_with(|| Accumulator {
                mirror_hash: ranked.mirror_hash.clone(),
                seq: ranked.seq,
                score: 0.0,
                bm25_rank: None,
                vec_rank: None,
                sources: Vec::new(),
                best_rank_anywhere: usize::MAX,
            });

            entry.score += contribution;
            if !entry.sources.contains(&list.source) {
                entry.sources.push(list.source);
            }
            entry.best_rank_anywhere = entry.best_rank_anywhere.min(ranked.rank);

            match list.source {
                RetrievalSource::Bm25 | RetrievalSource::Bm25Variant => {
                    entry.bm25_rank = Some(match entry.bm25_rank {
                        Some(r) => r.min(ranked.rank),
                        None => ranked.rank,
                    });
                }
                RetrievalSource::Vector | RetrievalSource::VectorVariant | RetrievalSource::Hyde => {
                    entry.vec_rank = Some(match entry.vec_rank {
                        Some(r) => r.min(ranked.rank),
                        None => ranked.rank,
                    });
                }
            }
        }
    }

    let mut candidates: Vec<FusionCandidate> = acc
        .into_values()
        .map(|a| {
            let bonus = if a.best_rank_anywhere == 1 {
                config.top_rank_bonus
            } else if a.best_rank_anywhere <= config.top_rank_threshold {
                0.4 * config.top_rank_bonus
            } else {
                0.0
            };
            FusionCandidate {
                mirror_hash: a.mirror_hash,
                seq: a.seq,
                bm25_rank: a.bm25_rank,
                vec_rank: a.vec_rank,
                fusion_score: a.score + bonus,
                sources: a.sources,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        b.fusion_score
            .partial_cmp(&a.fusion_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| tie_break_key(&a.mirror_hash, a.seq).cmp(&tie_break_key(&b.mirror_hash, b.seq)))
    });

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RetrievalConfig {
        RetrievalConfig::default()
    }

    fn ranked(hash: &str, seq: i64, rank: usize) -> RankedChunkId {
        RankedChunkId {
            mirror_hash: hash.to_string(),
            seq,
            rank,
        }
    }

    #[test]
    fn test_unique_candidate_pairs() {
        let lists = vec![
            RankedList {
                source: RetrievalSource::Bm25,
                ranked: vec![ranked("h1", 0, 1), ranked("h2", 0, 2)],
            },
            RankedList {
                source: RetrievalSource::Vector,
                ranked: vec![ranked("h1", 0, 1)],
            },
        ];
        let result = fuse(&lists, &cfg());
        let mut seen = std::collections::HashSet::new();
        for c in &result {
            assert!(seen.insert((c.mirror_hash.clone(), c.seq)));
        }
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_deterministic_sort_stable_across_runs() {
        let lists = vec![RankedList {
            source: RetrievalSource::Bm25,
            ranked: vec![ranked("h1", 0, 1), ranked("h2", 0, 1)],
        }];
        let r1 = fuse(&lists, &cfg());
        let r2 = fuse(&lists, &cfg());
        let keys1: Vec<_> = r1.iter().map(|c| (c.mirror_hash.clone(), c.seq)).collect();
        let keys2: Vec<_> = r2.iter().map(|c| (c.mirror_hash.clone(), c.seq)).collect();
        assert_eq!(keys1, keys2);
        // Equal score: tie-break must put h1 before h2 lexicographically.
        assert_eq!(keys1[0].0, "h1");
    }

    #[test]
    fn test_original_bm25_outranks_variant_only_hit() {
        // Scenario 3: A ranked #1 by original BM25, B ranked #1 only by a variant.
        let lists = vec![
            RankedList {
                source: RetrievalSource::Bm25,
                ranked: vec![ranked("docA", 0, 1), ranked("docB", 0, 2)],
            },
            RankedList {
                source: RetrievalSource::Bm25Variant,
                ranked: vec![ranked("docB", 0, 1)],
            },
        ];
        let result = fuse(&lists, &cfg());
        let score_of = |h: &str| result.iter().find(|c| c.mirror_hash == h).unwrap().fusion_score;
        assert!(score_of("docA") > score_of("docB"));
        assert_eq!(result[0].mirror_hash, "docA");
    }

    #[test]
    fn test_fusion_is_commutative_over_input_order() {
        let lists_a = vec![
            RankedList {
                source: RetrievalSource::Bm25,
                ranked: vec![ranked("h1", 0, 1)],
            },
            RankedList {
                source: RetrievalSource::Vector,
                ranked: vec![ranked("h1", 0, 3)],
            },
        ];
        let lists_b = vec![
            RankedList {
                source: RetrievalSource::Vector,
                ranked: vec![ranked("h1", 0, 3)],
            },
            RankedList {
                source: RetrievalSource::Bm25,
                ranked: vec![ranked("h1", 0, 1)],
            },
        ];
        let ra = fuse(&lists_a, &cfg());
        let rb = fuse(&lists_b, &cfg());
        assert!((ra[0].fusion_score - rb[0].fusion_score).abs() < 1e-12);
    }

    #[test]
    fn test_top_rank_bonus_applied_for_rank_one() {
        let lists = vec![RankedList {
            source: RetrievalSource::Bm25,
            ranked: vec![ranked("h1", 0, 1)],
        }];
        let result = fuse(&lists, &cfg());
        let base = rrf_contribution(60.0, 1, 2.0);
        assert!((result[0].fusion_score - (base + 0.1)).abs() < 1e-9);
    }

    #[test]
    fn test_determinism_100_runs() {
        let lists = vec![RankedList {
            source: RetrievalSource::Bm25,
            ranked: (1..=20)
                .map(|i| ranked(&format!("h{i}"), 0, i as usize))
                .collect(),
        }];
        let first = fuse(&lists, &cfg());
        let first_order: Vec<_> = first.iter().map(|c| c.mirror_hash.clone()).collect();
        for _ in 0..100 {
            let r = fuse(&lists, &cfg());
            let order: Vec<_> = r.iter().map(|c| c.mirror_hash.clone()).collect();
            assert_eq!(order, first_order);
        }
    }
}
