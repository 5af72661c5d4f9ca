//! Vector retrieval (C6): embeds the query, searches the nearest-neighbor
//! index, resolves hits against `StorePort` document metadata, and returns a
//! fusion-ready ranked list.
//!
//! Grounded on this codebase's original `fetch_vector_candidates` (embed
//! query, cosine similarity scan, truncate-to-k), generalized to the vector
//! index port, collection/tag/lang filtering, and the HyDE query-prefix rule.

use std::collections::HashMap;

use crate::error::{RetrievalError, Result};
use crate::models::{DocumentInfo, RankedChunkId};
use crate::ports::{EmbeddingPort, RetrievalFilters, StorePort, VectorIndexPort, VectorSearchOpts};
use crate::score::normalize_cosine_distance;

/// Prefix applied to every query embedded for retrieval, matching the prefix
/// convention this embedding model family expects for asymmetric search.
const QUERY_PREFIX: &str = "task: search result | query: ";

#[derive(Debug, Clone)]
pub struct VectorOptions {
    pub candidate_k: usize,
    pub full_mode: bool,
    pub min_score: f64,
}

impl Default for VectorOptions {
    fn default() -> Self {
        Self {
            candidate_k: 50,
            full_mode: false,
            min_score: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VectorHit {
    pub mirror_hash: String,
    pub seq: i64,
    pub document: Option<DocumentInfo>,
    pub score: f64,
}

#[derive(Debug, Clone, Default)]
pub struct VectorResult {
    pub ranked: Vec<RankedChunkId>,
    pub hits: Vec<VectorHit>,
}

/// Run C6. `raw_query_text` is embedded as-is (the caller decides whether it
/// is the user's query or a HyDE passage); `QUERY_PREFIX` is always applied.
pub async fn search_vector(
    store: &dyn StorePort,
    vector_index: &dyn VectorIndexPort,
    embedder: &dyn EmbeddingPort,
    raw_query_text: &str,
    filters: &RetrievalFilters,
    opts: &VectorOptions,
) -> Result<VectorResult> {
    if !vector_index.search_available() {
        return Err(RetrievalError::vec_search_unavailable(
            "no vector index configured",
        ));
    }
    if raw_query_text.trim().is_empty() {
        return Err(RetrievalError::invalid_input("query must not be empty"));
    }

    let prefixed = format!("{QUERY_PREFIX}{raw_query_text}");
    let query_vec = embedder
        .embed(&prefixed)
        .await
        .map_err(|e| RetrievalError::query_failed("query embedding failed", e))?;

    // Inflate k when tag filters are active so post-filtering still yields
    // enough candidates; the orchestrator's RetrievalConfig owns the multiplier.
    let search_k = if filters.tags_all.is_empty() && filters.tags_any.is_empty() {
        opts.candidate_k
    } else {
        opts.candidate_k.saturating_mul(3)
    };

    let search_opts = VectorSearchOpts { min_score: None };
    let nearest = vector_index
        .search_nearest(&query_vec, search_k, &search_opts)
        .await
        .map_err(|e| RetrievalError::query_failed("vector search failed", e))?;

    if nearest.is_empty() {
        return Ok(VectorResult::default());
    }

    let mirror_hashes: Vec<String> = nearest.iter().map(|r| r.mirror_hash.clone()).collect();
    let mut unique_hashes = mirror_hashes.clone();
    unique_hashes.sort();
    unique_hashes.dedup();

    // Build a docid->tags map only after we know which documents are in play;
    // resolve document info per mirror_hash via list_documents+filter since
    // StorePort exposes no direct mirror_hash->DocumentInfo batch lookup beyond
    // per-docid fetch; the collection filter narrows the candidate pool first.
    let all_docs = store
        .list_documents(filters.collection.as_deref())
        .await
        .map_err(|e| RetrievalError::query_failed("document lookup failed", e))?;

    let mut docs_by_mirror: HashMap<String, DocumentInfo> = HashMap::new();
    for doc in all_docs {
        if unique_hashes.contains(&doc.mirror_hash) {
            docs_by_mirror.entry(doc.mirror_hash.clone()).or_insert(doc);
        }
    }

    let mut tags_ok: HashMap<String, bool> = HashMap::new();
    if !filters.tags_all.is_empty() || !filters.tags_any.is_empty() {
        let docids: Vec<String> = docs_by_mirror.values().map(|d| d.docid.clone()).collect();
        let tags_by_doc = store
            .get_tags_batch(&docids)
            .await
            .map_err(|e| RetrievalError::query_failed("tag lookup failed", e))?;
        for doc in docs_by_mirror.values() {
            let names: Vec<&str> = tags_by_doc
                .get(&doc.docid)
                .map(|tags| tags.iter().map(|t| t.name.as_str()).collect())
                .unwrap_or_default();
            let all_ok = filters.tags_all.iter().all(|t| names.contains(&t.as_str()));
            let any_ok = filters.tags_any.is_empty()
                || filters.tags_any.iter().any(|t| names.contains(&t.as_str()));
            tags_ok.insert(doc.mirror_hash.clone(), all_ok && any_ok);
        }
    }

    // Strict lang filter: exact match against the hit's own chunk language,
    // excluding null. Requires a per-(mirror_hash, seq) chunk lookup, so the
    // candidate mirrors are batch-fetched up front the same way the BM25 path
    // resolves its tag filter.
    let chunks_by_mirror = if filters.lang.is_some() {
        store
            .get_chunks_batch(&unique_hashes)
            .await
            .map_err(|e| RetrievalError::query_failed("chunk lookup failed", e))?
    } else {
        HashMap::new()
    };

    let mut hits: Vec<VectorHit> = Vec::new();
    for row in nearest {
        if filters.collection.is_some() && !docs_by_mirror.contains_key(&row.mirror_hash) {
            continue;
        }
        if let Some(&ok) = tags_ok.get(&row.mirror_hash) {
            if !ok {
                continue;
            }
        }
        if let Some(lang_filter) = &filters.lang {
            let chunk_lang = chunks_by_mirror
                .get(&row.mirror_hash)
                .and_then(|chunks| chunks.iter().find(|c| c.seq == row.seq))
                .and_then(|c| c.language.as_deref());
            if chunk_lang != Some(lang_filter.as_str()) {
                continue;
            }
        }
        let score = normalize_cosine_distance(row.distance);
        if score < opts.min_score {
            continue;
        }
        hits.push(VectorHit {
            mirror_hash: row.mirror_hash.clone(),
            seq: row.seq,
            document: docs_by_mirror.get(&row.mirror_hash).cloned(),
            score,
        });
    }

    if opts.full_mode {
        // Collapse to one hit per docid (a mirror_hash can back more than one
        // document); hits with no resolved document fall back to their own
        // mirror_hash as the dedup key.
        let mut best: HashMap<String, usize> = HashMap::new();
        for (idx, hit) in hits.iter().enumerate() {
            let key = hit
                .document
                .as_ref()
                .map(|d| d.docid.clone())
                .unwrap_or_else(|| hit.mirror_hash.clone());
            best.entry(key)
                .and_modify(|cur| {
                    if hits[*cur].score < hit.score {
                        *cur = idx;
                    }
                })
                .or_insert(idx);
        }
        let mut indices: Vec<usize> = best.into_values().collect();
        indices.sort();
        hits = indices.into_iter().map(|i| hits[i].clone()).collect();
    }

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                crate::score::tie_break_key(&a.mirror_hash, a.seq)
                    .cmp(&crate::score::tie_break_key(&b.mirror_hash, b.seq))
            })
    });
    hits.truncate(opts.candidate_k);

    let ranked = hits
        .iter()
        .enumerate()
        .map(|(i, h)| RankedChunkId {
            mirror_hash: h.mirror_hash.clone(),
            seq: h.seq,
            rank: i + 1,
        })
        .collect();

    Ok(VectorResult { ranked, hits })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FtsRow, FtsSearchOpts, NearestVectorRow};
    use async_trait::async_trait;

    struct FakeEmbedder;
    #[async_trait]
    impl EmbeddingPort for FakeEmbedder {
        fn dimensions(&self) -> usize {
            3
        }
        fn model_uri(&self) -> &str {
            "fake"
        }
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
    }

    struct FakeVectorIndex {
        rows: Vec<NearestVectorRow>,
        available: bool,
    }
    #[async_trait]
    impl VectorIndexPort for FakeVectorIndex {
        fn search_available(&self) -> bool {
            self.available
        }
        fn dimensions(&self) -> usize {
            3
        }
        fn model(&self) -> &str {
            "fake"
        }
        async fn upsert_vectors(
            &self,
            _rows: &[(String, i64, Vec<f32>)],
            _model_uri: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn search_nearest(
            &self,
            _query_vec: &[f32],
            k: usize,
            _opts: &VectorSearchOpts,
        ) -> anyhow::Result<Vec<NearestVectorRow>> {
            Ok(self.rows.iter().take(k).cloned().collect())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        documents: Vec<DocumentInfo>,
        chunks: HashMap<String, Vec<crate::models::Chunk>>,
    }
    #[async_trait]
    impl StorePort for FakeStore {
        async fn get_collections(&self) -> anyhow::Result<Vec<String>> {
            Ok(vec![])
        }
        async fn list_documents(
            &self,
            _collection: Option<&str>,
        ) -> anyhow::Result<Vec<DocumentInfo>> {
            Ok(self.documents.clone())
        }
        async fn get_document_by_docid(&self, _docid: &str) -> anyhow::Result<Option<DocumentInfo>> {
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
            mirror_hashes: &[String],
        ) -> anyhow::Result<HashMap<String, Vec<crate::models::Chunk>>> {
            let mut out = HashMap::new();
            for h in mirror_hashes {
                if let Some(c) = self.chunks.get(h) {
                    out.insert(h.clone(), c.clone());
                }
            }
            Ok(out)
        }
        async fn search_fts(&self, _query: &str, _opts: &FtsSearchOpts) -> anyhow::Result<Vec<FtsRow>> {
            Ok(vec![])
        }
        async fn get_tags_batch(
            &self,
            _docids: &[String],
        ) -> anyhow::Result<HashMap<String, Vec<crate::models::Tag>>> {
            Ok(HashMap::new())
        }
    }

    #[tokio::test]
    async fn test_unavailable_index_errors() {
        let index = FakeVectorIndex { rows: vec![], available: false };
        let err = search_vector(
            &FakeStore::default(),
            &index,
            &FakeEmbedder,
            "query",
            &RetrievalFilters::default(),
            &VectorOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "VEC_SEARCH_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_ranks_by_similarity_descending() {
        let index = FakeVectorIndex {
            rows: vec![
                NearestVectorRow { mirror_hash: "h1".into(), seq: 0, distance: 0.1 },
                NearestVectorRow { mirror_hash: "h2".into(), seq: 0, distance: 0.8 },
            ],
            available: true,
        };
        let result = search_vector(
            &FakeStore::default(),
            &index,
            &FakeEmbedder,
            "query",
            &RetrievalFilters::default(),
            &VectorOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(result.ranked[0].mirror_hash, "h1");
    }

    #[tokio::test]
    async fn test_empty_query_is_invalid_input() {
        let index = FakeVectorIndex { rows: vec![], available: true };
        let err = search_vector(
            &FakeStore::default(),
            &index,
            &FakeEmbedder,
            "   ",
            &RetrievalFilters::default(),
            &VectorOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }

    fn chunk(hash: &str, seq: i64, lang: Option<&str>) -> crate::models::Chunk {
        crate::models::Chunk {
            mirror_hash: hash.to_string(),
            seq,
            text: "text".to_string(),
            start_line: None,
            end_line: None,
            language: lang.map(str::to_string),
            token_count: None,
        }
    }

    fn doc(mirror_hash: &str, docid: &str) -> DocumentInfo {
        DocumentInfo {
            docid: docid.to_string(),
            collection: "col".to_string(),
            rel_path: format!("{docid}.md"),
            uri: format!("file://col/{docid}.md"),
            title: None,
            mirror_hash: mirror_hash.to_string(),
            active: true,
            source_metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_lang_filter_excludes_mismatched_chunk_language() {
        let index = FakeVectorIndex {
            rows: vec![
                NearestVectorRow { mirror_hash: "h1".into(), seq: 0, distance: 0.1 },
                NearestVectorRow { mirror_hash: "h2".into(), seq: 0, distance: 0.2 },
            ],
            available: true,
        };
        let mut chunks = HashMap::new();
        chunks.insert("h1".to_string(), vec![chunk("h1", 0, Some("en"))]);
        chunks.insert("h2".to_string(), vec![chunk("h2", 0, Some("fr"))]);
        let store = FakeStore { documents: vec![], chunks };

        let filters = RetrievalFilters { lang: Some("en".to_string()), ..Default::default() };
        let result = search_vector(&store, &index, &FakeEmbedder, "query", &filters, &VectorOptions::default())
            .await
            .unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].mirror_hash, "h1");
    }

    #[tokio::test]
    async fn test_lang_filter_excludes_null_language_chunk() {
        let index = FakeVectorIndex {
            rows: vec![NearestVectorRow { mirror_hash: "h1".into(), seq: 0, distance: 0.1 }],
            available: true,
        };
        let mut chunks = HashMap::new();
        chunks.insert("h1".to_string(), vec![chunk("h1", 0, None)]);
        let store = FakeStore { documents: vec![], chunks };

        let filters = RetrievalFilters { lang: Some("en".to_string()), ..Default::default() };
        let result = search_vector(&store, &index, &FakeEmbedder, "query", &filters, &VectorOptions::default())
            .await
            .unwrap();
        assert!(result.hits.is_empty());
    }

    #[tokio::test]
    async fn test_full_mode_collapses_by_docid_not_mirror_hash() {
        // One docid spread across two distinct mirror_hashes collapses to its
        // single best-scoring hit — dedup must key on docid, not mirror_hash.
        let opts = VectorOptions { full_mode: true, ..Default::default() };
        let index = FakeVectorIndex {
            rows: vec![
                NearestVectorRow { mirror_hash: "h1".into(), seq: 0, distance: 0.1 },
                NearestVectorRow { mirror_hash: "h2".into(), seq: 0, distance: 0.5 },
            ],
            available: true,
        };
        let store = FakeStore {
            documents: vec![doc("h1", "docA"), doc("h2", "docA")],
            chunks: HashMap::new(),
        };
        let result = search_vector(&store, &index, &FakeEmbedder, "query", &RetrievalFilters::default(), &opts)
            .await
            .unwrap();
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].mirror_hash, "h1");
    }
}
