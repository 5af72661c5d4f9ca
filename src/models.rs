//! Core data model for the retrieval pipeline.
//!
//! These types mirror the entities in the data model: mirror content, chunks,
//! documents, vectors, and the ranked/fused/reranked candidates and search
//! results that flow through the pipeline. Everything here is plain data;
//! the pipeline components in [`crate::score`], [`crate::fusion`], [`crate::rerank`],
//! and [`crate::orchestrator`] operate on these types without owning storage.

use serde::Serialize;
use std::collections::HashMap;

/// A chunk of mirror content, identified by `(mirror_hash, seq)`.
///
/// Chunks for a given `mirror_hash` are replaced atomically by ingestion;
/// the core treats them as immutable once fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub mirror_hash: String,
    pub seq: i64,
    pub text: String,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
    pub language: Option<String>,
    pub token_count: Option<i64>,
}

/// Source-of-record metadata carried by a document (mime, ext, size, mtime, hash).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceMetadata {
    pub mime: Option<String>,
    pub ext: Option<String>,
    pub size: Option<i64>,
    pub mtime: Option<i64>,
    pub hash: Option<String>,
}

/// A tag attached to a document, grouped by where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub source: TagSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagSource {
    User,
    Frontmatter,
}

/// One active logical document per `(collection, rel_path)`.
///
/// `docid` is stable across content changes of the same logical document;
/// multiple documents may share a `mirror_hash`.
#[derive(Debug, Clone)]
pub struct Document {
    pub docid: String,
    pub collection: String,
    pub rel_path: String,
    pub uri: String,
    pub title: Option<String>,
    pub mirror_hash: Option<String>,
    pub active: bool,
    pub source_metadata: SourceMetadata,
    pub tags: Vec<Tag>,
}

impl Document {
    /// Canonical URI of the form `<scheme>://<collection>/<rel_path>`.
    pub fn build_uri(scheme: &str, collection: &str, rel_path: &str) -> String {
        format!("{scheme}://{collection}/{rel_path}")
    }
}

/// A `(mirror_hash, seq, model_uri) -> vector` row, plus when it was embedded.
#[derive(Debug, Clone)]
pub struct Vector {
    pub mirror_hash: String,
    pub seq: i64,
    pub model_uri: String,
    pub values: Vec<f32>,
    pub embedded_at: i64,
}

/// Why a chunk appears in the embedding backlog for a given model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogReason {
    New,
    Changed,
    Force,
}

/// A backlog item: a chunk awaiting an embedding for some `model_uri`.
#[derive(Debug, Clone)]
pub struct BacklogItem {
    pub mirror_hash: String,
    pub seq: i64,
    pub title: Option<String>,
    pub text: String,
    pub reason: BacklogReason,
}

/// `(mirror_hash, seq, rank)`, rank is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedChunkId {
    pub mirror_hash: String,
    pub seq: i64,
    pub rank: usize,
}

/// Which retrieval source contributed a ranked list to fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetrievalSource {
    Bm25,
    Bm25Variant,
    Vector,
    VectorVariant,
    Hyde,
}

/// A single `(mirror_hash, seq)` entry in the fused candidate set.
///
/// Invariant: `(mirror_hash, seq)` is unique within a candidate set.
#[derive(Debug, Clone)]
pub struct FusionCandidate {
    pub mirror_hash: String,
    pub seq: i64,
    pub bm25_rank: Option<usize>,
    pub vec_rank: Option<usize>,
    pub fusion_score: f64,
    pub sources: Vec<RetrievalSource>,
}

impl FusionCandidate {
    /// Lexicographic tie-break key used across every deterministic sort.
    pub fn tie_break_key(&self) -> String {
        format!("{}:{}", self.mirror_hash, self.seq)
    }
}

/// A fusion candidate extended with a cross-encoder score and the final blend.
#[derive(Debug, Clone)]
pub struct RerankedCandidate {
    pub candidate: FusionCandidate,
    pub rerank_score: Option<f64>,
    pub blended_score: f64,
}

/// `conversion` metadata attached to a search result when content came from a mirror.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionInfo {
    pub mirror_hash: String,
    pub converter_id: Option<String>,
    pub converter_version: Option<String>,
}

/// Source document metadata attached to a search result.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub collection: String,
    pub rel_path: String,
    pub mime: Option<String>,
    pub ext: Option<String>,
}

/// A line range within a chunk, `[start_line, end_line]` inclusive.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct LineRange {
    pub start_line: i64,
    pub end_line: i64,
}

/// The projection surfaced to callers. Invariant: `0.0 <= score <= 1.0`.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub docid: String,
    pub score: f64,
    pub uri: String,
    pub title: Option<String>,
    pub snippet: String,
    pub snippet_language: Option<String>,
    pub snippet_range: Option<LineRange>,
    pub source: SourceInfo,
    pub conversion: Option<ConversionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<ResultExplain>,
}

/// Per-result score breakdown, populated only when `explain` was requested.
#[derive(Debug, Clone, Serialize)]
pub struct ResultExplain {
    pub rank: usize,
    pub bm25_score: Option<f64>,
    pub vec_score: Option<f64>,
    pub rerank_score: Option<f64>,
}

/// A citation backing one `[n]` marker in a grounded answer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Citation {
    pub docid: String,
    pub uri: String,
    pub start_line: Option<i64>,
    pub end_line: Option<i64>,
}

/// Output of the grounded-answer generator.
#[derive(Debug, Clone, Serialize)]
pub struct GroundedAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

/// Output of query expansion (C4), before caching.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ExpansionResult {
    #[serde(default)]
    pub lexical_queries: Vec<String>,
    #[serde(default)]
    pub vector_queries: Vec<String>,
    #[serde(default)]
    pub hyde: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Metadata returned alongside a set of search results.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMeta {
    pub mode: String,
    pub expanded: bool,
    pub reranked: bool,
    pub vectors_used: bool,
    pub total_results: usize,
    pub collection: Option<String>,
    pub lang: Option<String>,
    pub query_language: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explain: Option<Vec<String>>,
}

/// Final payload returned by the hybrid orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub results: Vec<SearchResult>,
    pub meta: SearchMeta,
}

/// A document's identity and filterable metadata, batch-fetched by mirror hash.
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub docid: String,
    pub collection: String,
    pub rel_path: String,
    pub uri: String,
    pub title: Option<String>,
    pub mirror_hash: String,
    pub active: bool,
    pub source_metadata: SourceMetadata,
}

/// `mirror_hash -> chunks` map, as returned by a batch fetch. See [`crate::chunklookup`].
pub type ChunkMap = HashMap<String, Vec<Chunk>>;
