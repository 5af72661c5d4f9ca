//! External port interfaces (§6): capability traits the pipeline consumes.
//!
//! These mirror the `Store` trait shape this codebase already uses for its
//! storage layer, generalized into the seven capability sets the retrieval
//! core needs. Each is `async_trait` so a concrete adapter (SQLite, a
//! vector-acceleration library, an LLM HTTP client) can own async I/O and
//! its own lifetime; the pipeline never downcasts or matches on a concrete
//! type, only on presence/absence of the capability.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::{BacklogItem, Chunk, DocumentInfo, Tag};

/// Filters shared by the BM25 and vector retrieval entry points.
#[derive(Debug, Clone, Default)]
pub struct RetrievalFilters {
    pub collection: Option<String>,
    pub lang: Option<String>,
    pub tags_all: Vec<String>,
    pub tags_any: Vec<String>,
}

/// One row returned by `searchFts`.
#[derive(Debug, Clone)]
pub struct FtsRow {
    pub mirror_hash: String,
    pub seq: i64,
    pub raw_score: f64,
    pub uri: Option<String>,
    pub docid: Option<String>,
    pub title: Option<String>,
    pub collection: Option<String>,
    pub rel_path: Option<String>,
    pub snippet: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FtsSearchOpts {
    pub limit: i64,
    pub collection: Option<String>,
    pub language: Option<String>,
    pub snippet: bool,
    pub tags_all: Vec<String>,
    pub tags_any: Vec<String>,
}

/// Read-only (except vectors) storage contract.
#[async_trait]
pub trait StorePort: Send + Sync {
    async fn get_collections(&self) -> anyhow::Result<Vec<String>>;
    async fn list_documents(&self, collection: Option<&str>) -> anyhow::Result<Vec<DocumentInfo>>;
    async fn get_document_by_docid(&self, docid: &str) -> anyhow::Result<Option<DocumentInfo>>;
    async fn get_content(&self, mirror_hash: &str) -> anyhow::Result<Option<String>>;
    async fn get_chunks(&self, mirror_hash: &str) -> anyhow::Result<Vec<Chunk>>;

    /// Batch chunk fetch. The core never issues a per-candidate chunk query.
    async fn get_chunks_batch(
        &self,
        mirror_hashes: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<Chunk>>>;

    /// FTS search. Implementations must report query-syntax errors as
    /// `RetrievalError::InvalidInput` (via the returned `anyhow::Error`'s
    /// downcast-able marker, see `crate::store_sqlite::FtsSyntaxError`).
    async fn search_fts(&self, query: &str, opts: &FtsSearchOpts) -> anyhow::Result<Vec<FtsRow>>;

    /// Batch tag fetch keyed by docid, to avoid N+1 when tag filters are active.
    async fn get_tags_batch(&self, docids: &[String]) -> anyhow::Result<HashMap<String, Vec<Tag>>>;
}

#[derive(Debug, Clone)]
pub struct NearestVectorRow {
    pub mirror_hash: String,
    pub seq: i64,
    pub distance: f64,
}

#[derive(Debug, Clone, Default)]
pub struct VectorSearchOpts {
    pub min_score: Option<f64>,
}

/// The ANN index the vector retrieval path queries.
#[async_trait]
pub trait VectorIndexPort: Send + Sync {
    fn search_available(&self) -> bool;
    fn dimensions(&self) -> usize;
    fn model(&self) -> &str;

    async fn upsert_vectors(
        &self,
        rows: &[(String, i64, Vec<f32>)],
        model_uri: &str,
    ) -> anyhow::Result<()>;

    async fn search_nearest(
        &self,
        query_vec: &[f32],
        k: usize,
        opts: &VectorSearchOpts,
    ) -> anyhow::Result<Vec<NearestVectorRow>>;
}

/// Backlog accounting for the embedding worker (C11).
#[async_trait]
pub trait VectorStatsPort: Send + Sync {
    async fn count_backlog(&self, model_uri: &str) -> anyhow::Result<usize>;

    /// Seek-paginated backlog scan: `after` is the last `(mirror_hash, seq)`
    /// cursor consumed by the previous call.
    async fn get_backlog(
        &self,
        model_uri: &str,
        limit: usize,
        after: Option<(String, i64)>,
    ) -> anyhow::Result<Vec<BacklogItem>>;
}

/// Embedding provider capability.
#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    fn dimensions(&self) -> usize;
    fn model_uri(&self) -> &str;
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: usize,
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 512,
            seed: Some(0),
        }
    }
}

/// LLM text-generation capability, used by C4 (expansion) and C10 (answers).
#[async_trait]
pub trait GenerationPort: Send + Sync {
    fn model_uri(&self) -> &str;
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct RerankHit {
    pub index: usize,
    pub score: f64,
}

/// Cross-encoder reranking capability.
#[async_trait]
pub trait RerankPort: Send + Sync {
    async fn rerank(&self, query: &str, texts: &[String]) -> anyhow::Result<Vec<RerankHit>>;
}

/// Pluggable expansion cache. Absence never changes correctness, only cost.
#[async_trait]
pub trait ExpansionCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}
