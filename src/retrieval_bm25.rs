//! BM25 retrieval (C5): FTS5 keyword search over chunks, batch-resolved
//! against `StorePort`, normalized, and returned as a fusion-ready ranked list.
//!
//! Grounded on this codebase's original `fetch_keyword_candidates` (FTS5
//! MATCH + rank negation), generalized to the `(mirror_hash, seq)` chunk
//! identity, batch chunk/tag fetch, and the `full` mode collapse rule.

use crate::error::{RetrievalError, Result};
use crate::models::RankedChunkId;
use crate::ports::{FtsSearchOpts, RetrievalFilters, StorePort};
use crate::score::normalize_bm25;
use crate::store_sqlite::FtsSyntaxError;

#[derive(Debug, Clone)]
pub struct Bm25Options {
    pub candidate_k: i64,
    pub full_mode: bool,
    pub min_score: f64,
    pub snippet: bool,
}

impl Default for Bm25Options {
    fn default() -> Self {
        Self {
            candidate_k: 50,
            full_mode: false,
            min_score: 0.0,
            snippet: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Bm25Hit {
    pub mirror_hash: String,
    pub seq: i64,
    pub docid: Option<String>,
    pub uri: Option<String>,
    pub title: Option<String>,
    pub collection: Option<String>,
    pub rel_path: Option<String>,
    pub snippet: Option<String>,
    pub score: f64,
    /// Raw FTS5 `rank` value this hit's `score` was normalized from. Kept
    /// around for the orchestrator's absolute "strong BM25" sigmoid check,
    /// which must not operate on the per-query min-max normalized score.
    pub raw_score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Bm25Result {
    pub ranked: Vec<RankedChunkId>,
    pub hits: Vec<Bm25Hit>,
}

/// Run C5. An empty or whitespace-only query is `INVALID_INPUT`. An FTS5
/// syntax error surfaces as `INVALID_INPUT`; any other store failure as
/// `QUERY_FAILED`.
pub async fn search_bm25(
    store: &dyn StorePort,
    query: &str,
    filters: &RetrievalFilters,
    opts: &Bm25Options,
) -> Result<Bm25Result> {
    if query.trim().is_empty() {
        return Err(RetrievalError::invalid_input("query must not be empty"));
    }

    let fts_opts = FtsSearchOpts {
        limit: opts.candidate_k,
        collection: filters.collection.clone(),
        language: filters.lang.clone(),
        snippet: opts.snippet,
        tags_all: filters.tags_all.clone(),
        tags_any: filters.tags_any.clone(),
    };

    let rows = store.search_fts(query, &fts_opts).await.map_err(|e| {
        if e.downcast_ref::<FtsSyntaxError>().is_some() {
            RetrievalError::invalid_input(format!("invalid query syntax: {e}"))
        } else {
            RetrievalError::query_failed("FTS search failed", e)
        }
    })?;

    if rows.is_empty() {
        return Ok(Bm25Result::default());
    }

    // Apply tag filters (tags_all/tags_any) by batch-fetching docid tags.
    let mut filtered = rows;
    if !filters.tags_all.is_empty() || !filters.tags_any.is_empty() {
        let docids: Vec<String> = filtered.iter().filter_map(|r| r.docid.clone()).collect();
        let tags_by_doc = store
            .get_tags_batch(&docids)
            .await
            .map_err(|e| RetrievalError::query_failed("tag lookup failed", e))?;
        filtered.retain(|row| {
            let Some(docid) = &row.docid else { return false };
            let names: Vec<&str> = tags_by_doc
                .get(docid)
                .map(|tags| tags.iter().map(|t| t.name.as_str()).collect())
                .unwrap_or_default();
            let all_ok = filters.tags_all.iter().all(|t| names.contains(&t.as_str()));
            let any_ok = filters.tags_any.is_empty()
                || filters.tags_any.iter().any(|t| names.contains(&t.as_str()));
            all_ok && any_ok
        });
    }

    // Dedup by (mirror_hash, seq); if a row lacks a usable seq, fall back to
    // the mirror's first chunk (seq 0) as the document-level key.
    let mut seen = std::collections::HashSet::new();
    filtered.retain(|row| seen.insert((row.mirror_hash.clone(), row.seq)));

    if opts.full_mode {
        // Collapse to one row per docid (a mirror_hash can back more than one
        // document): keep the best-scoring chunk.
        let mut best: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for (idx, row) in filtered.iter().enumerate() {
            let key = row.docid.clone().unwrap_or_else(|| row.mirror_hash.clone());
            best.entry(key)
                .and_modify(|cur| {
                    if filtered[*cur].raw_score > row.raw_score {
                        *cur = idx;
                    }
                })
                .or_insert(idx);
        }
        let mut indices: Vec<usize> = best.into_values().collect();
        indices.sort();
        filtered = indices.into_iter().map(|i| filtered[i].clone()).collect();
    }

    let raw_scores: Vec<f64> = filtered.iter().map(|r| r.raw_score).collect();
    let normalized = normalize_bm25(&raw_scores);

    let mut hits: Vec<Bm25Hit> = filtered
        .into_iter()
        .zip(normalized)
        .map(|(row, score)| Bm25Hit {
            mirror_hash: row.mirror_hash,
            seq: row.seq,
            docid: row.docid,
            uri: row.uri,
            title: row.title,
            collection: row.collection,
            rel_path: row.rel_path,
            snippet: row.snippet,
            score,
            raw_score: row.raw_score,
        })
        .collect();

    hits.retain(|h| h.score >= opts.min_score);
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                crate::score::tie_break_key(&a.mirror_hash, a.seq)
                    .cmp(&crate::score::tie_break_key(&b.mirror_hash, b.seq))
            })
    });

    let ranked = hits
        .iter()
        .enumerate()
        .map(|(i, h)| RankedChunkId {
            mirror_hash: h.mirror_hash.clone(),
            seq: h.seq,
            rank: i + 1,
        })
        .collect();

    Ok(Bm25Result { ranked, hits })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::FtsRow;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct FakeStore {
        rows: Vec<FtsRow>,
        syntax_error: bool,
    }

    #[async_trait]
    impl StorePort for FakeStore {
        async fn get_collections(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn list_documents(
            &self,
            _collection: Option<&str>,
        ) -> anyhow::Result<Vec<crate::models::DocumentInfo>> {
            Ok(vec![])
        }
        async fn get_document_by_docid(
            &self,
            _docid: &str,
        ) -> anyhow::Result<Option<crate::models::DocumentInfo>> {
            Ok(None)
        }
        async fn get_content(&self, _mirror_hash: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        async fn get_chunks(&self, _mirror_hash: &str) -> anyhow::Result<Vec<crate::models::Chunk>> {
            Ok(vec![])
        }
        async fn get_chunks_batch(
            &self,
            _mirror_hashes: &[String],
        ) -> anyhow::Result<HashMap<String, Vec<crate::models::Chunk>>> {
            Ok(HashMap::new())
        }
        async fn search_fts(&self, _query: &str, _opts: &FtsSearchOpts) -> anyhow::Result<Vec<FtsRow>> {
            if self.syntax_error {
                return Err(anyhow::Error::new(FtsSyntaxError("bad token".to_string())));
            }
            Ok(self.rows.clone())
        }
        async fn get_tags_batch(
            &self,
            _docids: &[String],
        ) -> anyhow::Result<HashMap<String, Vec<crate::models::Tag>>> {
            Ok(HashMap::new())
        }
    }

    fn row(hash: &str, seq: i64, raw_score: f64) -> FtsRow {
        FtsRow {
            mirror_hash: hash.to_string(),
            seq,
            raw_score,
            uri: Some(format!("file://col/{hash}.md")),
            docid: Some(hash.to_string()),
            title: None,
            collection: Some("col".to_string()),
            rel_path: Some(format!("{hash}.md")),
            snippet: Some("...".to_string()),
        }
    }

    #[tokio::test]
    async fn test_empty_query_is_invalid_input() {
        let store = FakeStore { rows: vec![], syntax_error: false };
        let err = search_bm25(&store, "   ", &RetrievalFilters::default(), &Bm25Options::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_syntax_error_surfaces_as_invalid_input() {
        let store = FakeStore { rows: vec![], syntax_error: true };
        let err = search_bm25(&store, "bad\"query", &RetrievalFilters::default(), &Bm25Options::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_ranks_by_score_with_tie_break() {
        let store = FakeStore {
            rows: vec![row("h1", 0, -5.0), row("h2", 0, -1.0)],
            syntax_error: false,
        };
        let result = search_bm25(&store, "hello", &RetrievalFilters::default(), &Bm25Options::default())
            .await
            .unwrap();
        assert_eq!(result.ranked[0].mirror_hash, "h1");
        assert_eq!(result.ranked[0].rank, 1);
    }

    #[tokio::test]
    async fn test_full_mode_collapses_to_one_per_mirror() {
        let store = FakeStore {
            rows: vec![row("h1", 0, -5.0), row("h1", 1, -2.0)],
            syntax_error: false,
        };
        let opts = Bm25Options {
            full_mode: true,
            ..Bm25Options::default()
        };
        let result = search_bm25(&store, "hello", &RetrievalFilters::default(), &opts)
            .await
            .unwrap();
        assert_eq!(result.ranked.len(), 1);
    }

    #[tokio::test]
    async fn test_full_mode_collapses_by_docid_not_mirror_hash() {
        // Two documents share one mirror_hash (a mirror can back multiple
        // documents) but have distinct docids: both must survive full mode.
        let mut shared_mirror = row("h1", 0, -5.0);
        shared_mirror.docid = Some("docA".to_string());
        let mut shared_mirror_other_doc = row("h1", 1, -4.0);
        shared_mirror_other_doc.docid = Some("docB".to_string());

        let store = FakeStore {
            rows: vec![shared_mirror, shared_mirror_other_doc],
            syntax_error: false,
        };
        let opts = Bm25Options { full_mode: true, ..Bm25Options::default() };
        let result = search_bm25(&store, "hello", &RetrievalFilters::default(), &opts)
            .await
            .unwrap();
        assert_eq!(result.ranked.len(), 2);

        // Conversely, one docid spread across two distinct mirror_hashes
        // collapses to its single best-scoring row.
        let mut doc_a_1 = row("h1", 0, -5.0);
        doc_a_1.docid = Some("docA".to_string());
        let mut doc_a_2 = row("h2", 0, -2.0);
        doc_a_2.docid = Some("docA".to_string());

        let store = FakeStore {
            rows: vec![doc_a_1, doc_a_2],
            syntax_error: false,
        };
        let result = search_bm25(&store, "hello", &RetrievalFilters::default(), &opts)
            .await
            .unwrap();
        assert_eq!(result.ranked.len(), 1);
        assert_eq!(result.ranked[0].mirror_hash, "h1");
    }

    #[tokio::test]
    async fn test_min_score_filters_weak_hits() {
        let store = FakeStore {
            rows: vec![row("h1", 0, -5.0), row("h2", 0, -4.9)],
            syntax_error: false,
        };
        let opts = Bm25Options {
            min_score: 0.99,
            ..Bm25Options::default()
        };
        let result = search_bm25(&store, "hello", &RetrievalFilters::default(), &opts)
            .await
            .unwrap();
        assert!(result.ranked.len() <= 1);
    }
}
