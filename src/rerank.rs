//! Reranker and blending (C8): best-chunk-per-document selection,
//! cross-encoder scoring, and tiered fusion/rerank score blending.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RetrievalConfig;
use crate::models::{FusionCandidate, RerankedCandidate};
use crate::ports::{RerankHit, RerankPort};
use crate::score::{normalize_minmax, tie_break_key};

const MAX_CHUNK_CHARS: usize = 4000;

/// HTTP-backed [`RerankPort`], grounded on [`crate::generation::OpenAiGenerator`]'s
/// reqwest client and retry policy: exponential backoff on 429/5xx, fail-fast
/// on other 4xx. Targets a Cohere-compatible `/v1/rerank` endpoint.
pub struct HttpReranker {
    model: String,
    api_key: String,
    base_url: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl HttpReranker {
    pub fn new(model: impl Into<String>, timeout_secs: u64, max_retries: u32) -> anyhow::Result<Self> {
        let api_key = std::env::var("RERANK_API_KEY")
            .map_err(|_| anyhow::anyhow!("RERANK_API_KEY environment variable not set"))?;
        let base_url = std::env::var("RERANK_API_BASE")
            .unwrap_or_else(|_| "https://api.cohere.com/v1".to_string());
        Ok(Self {
            model: model.into(),
            api_key,
            base_url,
            timeout_secs,
            max_retries,
        })
    }
}

#[async_trait]
impl RerankPort for HttpReranker {
    async fn rerank(&self, query: &str, texts: &[String]) -> anyhow::Result<Vec<RerankHit>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()?;

        let body = serde_json::json!({
            "model": self.model,
            "query": query,
            "documents": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(format!("{}/rerank", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_rerank_response(&json);
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow::anyhow!("rerank API error {}: {}", status, body_text));
                        continue;
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    anyhow::bail!("rerank API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("rerank failed after retries")))
    }
}

fn parse_rerank_response(json: &serde_json::Value) -> anyhow::Result<Vec<RerankHit>> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| anyhow::anyhow!("invalid rerank response: missing results[]"))?;

    results
        .iter()
        .map(|r| {
            let index = r
                .get("index")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| anyhow::anyhow!("rerank result missing index"))?;
            let score = r
                .get("relevance_score")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| anyhow::anyhow!("rerank result missing relevance_score"))?;
            Ok(RerankHit {
                index: index as usize,
                score,
            })
        })
        .collect()
}

/// Blend weights for one positional tier.
struct Tier {
    max_rank: usize,
    fusion_weight: f64,
    rerank_weight: f64,
}

fn tiers() -> [Tier; 3] {
    [
        Tier {
            max_rank: 3,
            fusion_weight: 0.75,
            rerank_weight: 0.25,
        },
        Tier {
            max_rank: 10,
            fusion_weight: 0.6,
            rerank_weight: 0.4,
        },
        Tier {
            max_rank: usize::MAX,
            fusion_weight: 0.4,
            rerank_weight: 0.6,
        },
    ]
}

fn tier_for_rank(rank: usize) -> &'static Tier {
    // Leaked once; the table is tiny and fixed for the process lifetime.
    static TIERS: std::sync::OnceLock<[Tier; 3]> = std::sync::OnceLock::new();
    let table = TIERS.get_or_init(tiers);
    table.iter().find(|t| rank <= t.max_rank).unwrap()
}

/// Degrade to fusion-only blending: `rerank_score = None`, `blended_score`
/// is the fusion score min-max normalized across the *full* candidate set.
pub fn blend_without_rerank(candidates: Vec<FusionCandidate>) -> Vec<RerankedCandidate> {
    let raw: Vec<f64> = candidates.iter().map(|c| c.fusion_score).collect();
    let normalized = normalize_minmax(&raw);
    let mut result: Vec<RerankedCandidate> = candidates
        .into_iter()
        .zip(normalized)
        .map(|(candidate, blended_score)| RerankedCandidate {
            candidate,
            rerank_score: None,
            blended_score,
        })
        .collect();
    sort_by_blended(&mut result);
    result
}

fn sort_by_blended(candidates: &mut [RerankedCandidate]) {
    candidates.sort_by(|a, b| {
        b.blended_score
            .partial_cmp(&a.blended_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                tie_break_key(&a.candidate.mirror_hash, a.candidate.seq)
                    .cmp(&tie_break_key(&b.candidate.mirror_hash, b.candidate.seq))
            })
    });
}

/// Chunk text lookup, keyed by `(mirror_hash, seq)`, needed to build reranker
/// payloads without a second store round-trip per candidate.
pub type ChunkTextLookup<'a> = dyn Fn(&str, i64) -> Option<&'a str> + 'a;

/// Rerank and blend `candidates` (already fusion-sorted) against `query`.
/// Degrades to [`blend_without_rerank`] on any reranker or chunk-fetch failure.
pub async fn rerank_and_blend(
    candidates: Vec<FusionCandidate>,
    query: &str,
    reranker: Option<&dyn RerankPort>,
    chunk_text: &ChunkTextLookup<'_>,
    config: &RetrievalConfig,
) -> Vec<RerankedCandidate> {
    let Some(reranker) = reranker else {
        return blend_without_rerank(candidates);
    };

    let max_candidates = config.rerank_max_candidates;
    let split_at = max_candidates.min(candidates.len());
    let (top, remaining) = candidates.split_at(split_at);
    let top = top.to_vec();
    let remaining = remaining.to_vec();

    // Best chunk per document within the top bucket.
    let mut best_per_doc: HashMap<String, usize> = HashMap::new();
    for (idx, c) in top.iter().enumerate() {
        best_per_doc
            .entry(c.mirror_hash.clone())
            .and_modify(|cur| {
                if top[*cur].fusion_score < c.fusion_score {
                    *cur = idx;
                }
            })
            .or_insert(idx);
    }
    let mut doc_order: Vec<(String, usize)> = best_per_doc.into_iter().collect();
    doc_order.sort_by(|a, b| a.0.cmp(&b.0));

    let mut texts = Vec::with_capacity(doc_order.len());
    let mut text_indices = Vec::with_capacity(doc_order.len());
    let mut fetch_failed = false;
    for (mirror_hash, idx) in &doc_order {
        let c = &top[*idx];
        match chunk_text(mirror_hash, c.seq) {
            Some(text) => {
                let truncated: String = text.chars().take(MAX_CHUNK_CHARS).collect();
                texts.push(truncated);
                text_indices.push(*idx);
            }
            None => {
                fetch_failed = true;
                break;
            }
        }
    }

    if fetch_failed || texts.is_empty() {
        let mut all = top;
        all.extend(remaining);
        return blend_without_rerank(all);
    }

    let hits = match reranker.rerank(query, &texts).await {
        Ok(h) => h,
        Err(_) => {
            let mut all = top;
            all.extend(remaining);
            return blend_without_rerank(all);
        }
    };

    // Map rerank scores back onto the `top` index space via `text_indices`.
    let mut rerank_by_top_idx: HashMap<usize, f64> = HashMap::new();
    for hit in &hits {
        if let Some(&top_idx) = text_indices.get(hit.index) {
            rerank_by_top_idx.insert(top_idx, hit.score);
        }
    }

    let fusion_raw: Vec<f64> = top
        .iter()
        .chain(remaining.iter())
        .map(|c| c.fusion_score)
        .collect();
    let fusion_norm = normalize_minmax(&fusion_raw);

    let rerank_raw: Vec<f64> = rerank_by_top_idx.values().cloned().collect();
    let rerank_norm_values = normalize_minmax(&rerank_raw);
    let rerank_keys: Vec<usize> = rerank_by_top_idx.keys().cloned().collect();
    let rerank_norm_by_idx: HashMap<usize, f64> = rerank_keys
        .into_iter()
        .zip(rerank_norm_values)
        .collect();

    let top_len = top.len();
    let mut result = Vec::with_capacity(top_len + remaining.len());
    for (idx, candidate) in top.into_iter().enumerate() {
        let fused_norm = fusion_norm[idx];
        let tier = tier_for_rank(idx + 1);
        let blended_score = match rerank_norm_by_idx.get(&idx) {
            Some(&rerank_norm) => {
                (tier.fusion_weight * fused_norm + tier.rerank_weight * rerank_norm).clamp(0.0, 1.0)
            }
            None => (tier.fusion_weight * fused_norm * 0.5).clamp(0.0, 1.0),
        };
        result.push(RerankedCandidate {
            candidate,
            rerank_score: rerank_by_top_idx.get(&idx).cloned(),
            blended_score,
        });
    }
    for (offset, candidate) in remaining.into_iter().enumerate() {
        let fused_norm = fusion_norm[top_len + offset];
        result.push(RerankedCandidate {
            candidate,
            rerank_score: None,
            blended_score: (0.4 * fused_norm * 0.5).clamp(0.0, 1.0),
        });
    }

    sort_by_blended(&mut result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RetrievalSource;
    use crate::ports::RerankHit;
    use async_trait::async_trait;

    fn candidate(hash: &str, score: f64) -> FusionCandidate {
        FusionCandidate {
            mirror_hash: hash.to_string(),
            seq: 0,
            bm25_rank: Some(1),
            vec_rank: None,
            fusion_score: score,
            sources: vec![RetrievalSource::Bm25],
        }
    }

    #[test]
    fn test_parse_rerank_response_extracts_hits() {
        let json = serde_json::json!({
            "results": [
                {"index": 1, "relevance_score": 0.9},
                {"index": 0, "relevance_score": 0.4},
            ]
        });
        let hits = parse_rerank_response(&json).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].index, 1);
        assert_eq!(hits[0].score, 0.9);
    }

    #[test]
    fn test_parse_rerank_response_missing_results_errors() {
        let json = serde_json::json!({});
        assert!(parse_rerank_response(&json).is_err());
    }

    #[test]
    fn test_blend_without_rerank_stays_in_unit_range() {
        let candidates = vec![candidate("a", 3.0), candidate("b", 1.0), candidate("c", 2.0)];
        let result = blend_without_rerank(candidates);
        for r in &result {
            assert!((0.0..=1.0).contains(&r.blended_score));
            assert!(r.rerank_score.is_none());
        }
        assert_eq!(result[0].candidate.mirror_hash, "a");
    }

    struct MockReranker;

    #[async_trait]
    impl RerankPort for MockReranker {
        async fn rerank(&self, _query: &str, texts: &[String]) -> anyhow::Result<Vec<RerankHit>> {
            Ok(texts
                .iter()
                .enumerate()
                .map(|(i, t)| RerankHit {
                    index: i,
                    score: t.len() as f64,
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_rerank_and_blend_stays_in_unit_range() {
        let candidates = vec![candidate("a", 3.0), candidate("b", 1.0)];
        let texts: HashMap<&str, &str> =
            HashMap::from([("a", "short"), ("b", "a much longer document body here")]);
        let lookup = move |hash: &str, _seq: i64| texts.get(hash).copied();
        let config = RetrievalConfig::default();
        let result =
            rerank_and_blend(candidates, "query", Some(&MockReranker), &lookup, &config).await;
        for r in &result {
            assert!((0.0..=1.0).contains(&r.blended_score));
        }
    }

    #[tokio::test]
    async fn test_degrades_on_reranker_failure() {
        struct FailingReranker;
        #[async_trait]
        impl RerankPort for FailingReranker {
            async fn rerank(&self, _q: &str, _t: &[String]) -> anyhow::Result<Vec<RerankHit>> {
                Err(anyhow::anyhow!("boom"))
            }
        }
        let candidates = vec![candidate("a", 3.0), candidate("b", 1.0)];
        let lookup = |_h: &str, _s: i64| Some("text");
        let config = RetrievalConfig::default();
        let result =
            rerank_and_blend(candidates, "query", Some(&FailingReranker), &lookup, &config).await;
        assert!(result.iter().all(|r| r.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_no_reranker_degrades_immediately() {
        let candidates = vec![candidate("a", 3.0), candidate("b", 1.0)];
        let lookup = |_h: &str, _s: i64| Some("text");
        let config = RetrievalConfig::default();
        let result = rerank_and_blend(candidates, "query", None, &lookup, &config).await;
        assert!(result.iter().all(|r| r.rerank_score.is_none()));
    }
}
