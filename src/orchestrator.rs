//! Hybrid retrieval orchestrator (C9): the fixed pipeline that ties language
//! resolution, query expansion, BM25/vector retrieval, fusion, and reranking
//! together into the final `SearchResults` payload.

use std::collections::HashMap;

use crate::chunklookup::ChunkLookup;
use crate::config::Config;
use crate::error::{RetrievalError, Result};
use crate::expansion::{self, is_bm25_strong};
use crate::fusion::{self, RankedList};
use crate::lang;
use crate::models::{
    ChunkMap, ConversionInfo, LineRange, ResultExplain, RetrievalSource, SearchMeta, SearchResult,
    SearchResults, SourceInfo,
};
use crate::ports::{
    EmbeddingPort, ExpansionCache, GenerationPort, RerankPort, RetrievalFilters, StorePort,
    VectorIndexPort,
};
use crate::rerank;
use crate::retrieval_bm25::{self, Bm25Hit, Bm25Options};
use crate::retrieval_vector::{self, VectorHit, VectorOptions};
use crate::score;

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub lang_hint: Option<String>,
    pub filters: RetrievalFilters,
    pub full_mode: bool,
    pub limit: Option<i64>,
    pub explain: bool,
}

/// Everything the orchestrator needs, gathered behind the port traits so the
/// concrete SQLite/HTTP adapters stay swappable.
pub struct Dependencies<'a> {
    pub store: &'a dyn StorePort,
    pub vector_index: Option<&'a dyn VectorIndexPort>,
    pub embedder: Option<&'a dyn EmbeddingPort>,
    pub generation: Option<&'a dyn GenerationPort>,
    pub expansion_cache: Option<&'a dyn ExpansionCache>,
    pub reranker: Option<&'a dyn RerankPort>,
}

/// Run C9 end to end. Never fails outright on a degradable sub-stage
/// (expansion, vector search, reranking); only an empty query, or a failed
/// BM25 search, produces an error.
#[tracing::instrument(skip(deps, config), fields(query_len = query.len()))]
pub async fn search(
    deps: &Dependencies<'_>,
    query: &str,
    opts: &QueryOptions,
    config: &Config,
) -> Result<SearchResults> {
    if query.trim().is_empty() {
        return Err(RetrievalError::invalid_input("query must not be empty"));
    }

    let retrieval_cfg = &config.retrieval;
    let mut explain_trace: Vec<String> = Vec::new();
    let query_language =
        lang::resolve_query_language(opts.lang_hint.as_deref(), opts.filters.lang.as_deref(), query);

    let final_limit = opts.limit.unwrap_or(retrieval_cfg.final_limit).max(1) as usize;
    let candidate_k = (final_limit as i64)
        .saturating_mul(retrieval_cfg.tag_filter_k_multiplier)
        .max(retrieval_cfg.rerank_max_candidates as i64);

    let bm25_opts = Bm25Options {
        candidate_k,
        full_mode: opts.full_mode,
        min_score: 0.0,
        snippet: true,
    };
    let bm25_result = retrieval_bm25::search_bm25(deps.store, query, &opts.filters, &bm25_opts).await?;
    tracing::debug!(hits = bm25_result.hits.len(), "bm25 stage complete");

    if opts.explain {
        explain_trace.push(format!("bm25: {} hits", bm25_result.hits.len()));
    }

    // "Strong BM25" is an absolute judgment of the raw score, not a verdict
    // relative to this query's own candidate set — so it runs the sigmoid
    // strength curve over the top-5 raw FTS5 scores, not the per-query
    // min-max normalized `Bm25Hit::score` used for ranking (that score is
    // always 1.0 for a lone hit regardless of how relevant it actually is).
    let strength_scores: Vec<f64> = bm25_result
        .hits
        .iter()
        .take(5)
        .map(|h| score::sigmoid_strength(h.raw_score, 4.5, 2.8))
        .collect();
    let skip_expansion = is_bm25_strong(
        &strength_scores,
        retrieval_cfg.strong_bm25_score,
        retrieval_cfg.strong_bm25_gap,
    );

    let expanded = if skip_expansion {
        None
    } else if let Some(generation) = deps.generation {
        expansion::expand(generation, deps.expansion_cache, query, &query_language, &config.expansion)
            .await
    } else {
        None
    };

    if opts.explain {
        explain_trace.push(format!(
            "expansion: skipped={skip_expansion} applied={}",
            expanded.is_some()
        ));
    }

    let mut lists = vec![RankedList {
        source: RetrievalSource::Bm25,
        ranked: bm25_result.ranked.clone(),
    }];

    let bm25_variant_opts = Bm25Options {
        candidate_k,
        full_mode: opts.full_mode,
        min_score: 0.0,
        snippet: false,
    };

    if let Some(expansion_result) = &expanded {
        for variant in &expansion_result.lexical_queries {
            if let Ok(variant_result) =
                retrieval_bm25::search_bm25(deps.store, variant, &opts.filters, &bm25_variant_opts).await
            {
                lists.push(RankedList {
                    source: RetrievalSource::Bm25Variant,
                    ranked: variant_result.ranked,
                });
            }
        }
    }

    let mut bm25_hits_by_key: HashMap<(String, i64), Bm25Hit> = HashMap::new();
    for hit in &bm25_result.hits {
        bm25_hits_by_key.insert((hit.mirror_hash.clone(), hit.seq), hit.clone());
    }

    let mut vector_hits_by_key: HashMap<(String, i64), VectorHit> = HashMap::new();
    let mut vectors_used = false;

    if let (Some(vector_index), Some(embedder)) = (deps.vector_index, deps.embedder) {
        let vector_opts = VectorOptions {
            candidate_k: candidate_k as usize,
            full_mode: opts.full_mode,
            min_score: 0.0,
        };

        if let Ok(vector_result) =
            retrieval_vector::search_vector(deps.store, vector_index, embedder, query, &opts.filters, &vector_opts)
                .await
        {
            vectors_used = true;
            for hit in &vector_result.hits {
                vector_hits_by_key.insert((hit.mirror_hash.clone(), hit.seq), hit.clone());
            }
            lists.push(RankedList {
                source: RetrievalSource::Vector,
                ranked: vector_result.ranked,
            });
        }

        if let Some(expansion_result) = &expanded {
            for variant in &expansion_result.vector_queries {
                if let Ok(variant_result) = retrieval_vector::search_vector(
                    deps.store,
                    vector_index,
                    embedder,
                    variant,
                    &opts.filters,
                    &vector_opts,
                )
                .await
                {
                    for hit in &variant_result.hits {
                        vector_hits_by_key
                            .entry((hit.mirror_hash.clone(), hit.seq))
                            .or_insert_with(|| hit.clone());
                    }
                    lists.push(RankedList {
                        source: RetrievalSource::VectorVariant,
                        ranked: variant_result.ranked,
                    });
                }
            }

            if let Some(hyde) = &expansion_result.hyde {
                if let Ok(hyde_result) =
                    retrieval_vector::search_vector(deps.store, vector_index, embedder, hyde, &opts.filters, &vector_opts)
                        .await
                {
                    for hit in &hyde_result.hits {
                        vector_hits_by_key
                            .entry((hit.mirror_hash.clone(), hit.seq))
                            .or_insert_with(|| hit.clone());
                    }
                    lists.push(RankedList {
                        source: RetrievalSource::Hyde,
                        ranked: hyde_result.ranked,
                    });
                }
            }
        }
    }

    if opts.explain {
        explain_trace.push(format!("vectors_used: {vectors_used}"));
    }

    let fused = fusion::fuse(&lists, retrieval_cfg);

    if opts.explain {
        explain_trace.push(format!("fusion: {} candidates", fused.len()));
    }

    let mirror_hashes: Vec<String> = fused.iter().map(|c| c.mirror_hash.clone()).collect();
    let chunk_map: ChunkMap = deps
        .store
        .get_chunks_batch(&mirror_hashes)
        .await
        .map_err(|e| RetrievalError::query_failed("chunk batch fetch failed", e))?;
    let lookup = ChunkLookup::new(&chunk_map);
    let chunk_text = move |mirror_hash: &str, seq: i64| lookup.get(mirror_hash, seq).map(|c| c.text.as_str());

    let reranked = rerank::rerank_and_blend(fused, query, deps.reranker, &chunk_text, retrieval_cfg).await;

    if opts.explain {
        explain_trace.push(format!("rerank: reranked={}", deps.reranker.is_some()));
    }

    // Final resolution pass (§4.9 step 7): re-fetch document/collection/tag
    // metadata for the fused-and-reranked candidates and re-apply
    // (collection, tags, lang) filters one last time, since a candidate
    // reaching this point may have been sourced only from a bm25_variant,
    // vector_variant, or hyde list whose hits were never captured above.
    let known_collections = deps
        .store
        .get_collections()
        .await
        .map_err(|e| RetrievalError::query_failed("collections lookup failed", e))?;
    if let Some(requested) = &opts.filters.collection {
        if !known_collections.contains(requested) {
            return Ok(SearchResults {
                results: Vec::new(),
                meta: SearchMeta {
                    mode: if opts.full_mode { "full".to_string() } else { "default".to_string() },
                    expanded: expanded.is_some(),
                    reranked: deps.reranker.is_some(),
                    vectors_used,
                    total_results: 0,
                    collection: opts.filters.collection.clone(),
                    lang: opts.filters.lang.clone(),
                    query_language,
                    explain: if opts.explain { Some(explain_trace) } else { None },
                },
            });
        }
    }

    let all_docs = deps
        .store
        .list_documents(opts.filters.collection.as_deref())
        .await
        .map_err(|e| RetrievalError::query_failed("document lookup failed", e))?;
    let mut docs_by_mirror: HashMap<String, crate::models::DocumentInfo> = HashMap::new();
    for doc in all_docs {
        docs_by_mirror.entry(doc.mirror_hash.clone()).or_insert(doc);
    }

    let mut tags_ok: HashMap<String, bool> = HashMap::new();
    if !opts.filters.tags_all.is_empty() || !opts.filters.tags_any.is_empty() {
        let docids: Vec<String> = docs_by_mirror.values().map(|d| d.docid.clone()).collect();
        let tags_by_doc = deps
            .store
            .get_tags_batch(&docids)
            .await
            .map_err(|e| RetrievalError::query_failed("tag lookup failed", e))?;
        for doc in docs_by_mirror.values() {
            let names: Vec<&str> = tags_by_doc
                .get(&doc.docid)
                .map(|tags| tags.iter().map(|t| t.name.as_str()).collect())
                .unwrap_or_default();
            let all_ok = opts.filters.tags_all.iter().all(|t| names.contains(&t.as_str()));
            let any_ok = opts.filters.tags_any.is_empty()
                || opts.filters.tags_any.iter().any(|t| names.contains(&t.as_str()));
            tags_ok.insert(doc.mirror_hash.clone(), all_ok && any_ok);
        }
    }

    let mut seen_docids = std::collections::HashSet::new();
    let mut results: Vec<SearchResult> = Vec::new();
    for (rank, reranked_candidate) in reranked.iter().enumerate() {
        if results.len() >= final_limit {
            break;
        }
        let candidate = &reranked_candidate.candidate;
        let key = (candidate.mirror_hash.clone(), candidate.seq);
        let chunk = lookup.get(&candidate.mirror_hash, candidate.seq);

        if let Some(lang_filter) = &opts.filters.lang {
            if chunk.and_then(|c| c.language.as_deref()) != Some(lang_filter.as_str()) {
                continue;
            }
        }
        if let Some(&ok) = tags_ok.get(&candidate.mirror_hash) {
            if !ok {
                continue;
            }
        }

        // Prefer the final-resolution `list_documents` lookup, then
        // vector-hit document metadata, then the BM25 hit's flat fields.
        // A candidate that resolves to nothing here never surfaced a real
        // document (e.g. it only came from a variant/HyDE list) and is
        // dropped rather than emitted with a raw mirror_hash standing in
        // for `docid`/`uri`.
        let resolved = docs_by_mirror
            .get(&candidate.mirror_hash)
            .cloned()
            .or_else(|| vector_hits_by_key.get(&key).and_then(|h| h.document.clone()));

        let (docid, uri, title, collection, rel_path, mime, ext) = if let Some(doc) = resolved {
            (
                doc.docid,
                doc.uri,
                doc.title,
                doc.collection,
                doc.rel_path,
                doc.source_metadata.mime,
                doc.source_metadata.ext,
            )
        } else if let Some(hit) = bm25_hits_by_key.get(&key) {
            let (Some(docid), Some(uri)) = (hit.docid.clone(), hit.uri.clone()) else {
                continue;
            };
            (
                docid,
                uri,
                hit.title.clone(),
                hit.collection.clone().unwrap_or_default(),
                hit.rel_path.clone().unwrap_or_default(),
                None,
                None,
            )
        } else {
            continue;
        };

        if opts.full_mode && !seen_docids.insert(docid.clone()) {
            continue;
        }

        let snippet = bm25_hits_by_key
            .get(&key)
            .and_then(|h| h.snippet.clone())
            .unwrap_or_else(|| chunk.map(|c| c.text.chars().take(500).collect()).unwrap_or_default());
        let snippet_language = chunk.and_then(|c| c.language.clone());
        let snippet_range = chunk.and_then(|c| match (c.start_line, c.end_line) {
            (Some(s), Some(e)) => Some(LineRange { start_line: s, end_line: e }),
            _ => None,
        });

        let explain = if opts.explain {
            Some(ResultExplain {
                rank: rank + 1,
                bm25_score: bm25_hits_by_key.get(&key).map(|h| h.score),
                vec_score: vector_hits_by_key.get(&key).map(|h| h.score),
                rerank_score: reranked_candidate.rerank_score,
            })
        } else {
            None
        };

        results.push(SearchResult {
            docid,
            score: reranked_candidate.blended_score,
            uri,
            title,
            snippet,
            snippet_language,
            snippet_range,
            source: SourceInfo { collection, rel_path, mime, ext },
            conversion: Some(ConversionInfo {
                mirror_hash: candidate.mirror_hash.clone(),
                converter_id: None,
                converter_version: None,
            }),
            explain,
        });
    }

    let meta = SearchMeta {
        mode: if opts.full_mode { "full".to_string() } else { "default".to_string() },
        expanded: expanded.is_some(),
        reranked: deps.reranker.is_some(),
        vectors_used,
        total_results: results.len(),
        collection: opts.filters.collection.clone(),
        lang: opts.filters.lang.clone(),
        query_language,
        explain: if opts.explain { Some(explain_trace) } else { None },
    };

    Ok(SearchResults { results, meta })
}
