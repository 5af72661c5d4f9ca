//! # grounded-retrieve
//!
//! **A local-first hybrid retrieval and grounded-question-answering engine.**
//!
//! This crate indexes a user's own collections (notes, docs, source trees)
//! into a single on-disk store and serves keyword (BM25), vector (ANN), and
//! hybrid queries over them, with an optional grounded-answer generator that
//! emits citations matched exactly to the `[n]` markers present in the
//! answer text. File discovery, chunking, the raw storage engine, and the
//! LLM adapters are external collaborators; this crate consumes them through
//! the port traits in [`ports`] and implements the retrieval pipeline that
//! sits on top of them.
//!
//! ## Pipeline
//!
//! ```text
//! query ──▶ lang::detect ──▶ orchestrator::search
//!                                │
//!              ┌─────────────────┼──────────────────┐
//!              ▼                 ▼                  ▼
//!       expansion::expand   retrieval_bm25      retrieval_vector
//!      (lexical/semantic/     ::search_bm25       ::search_vector
//!       HyDE, cached)              │                  │
//!              └─────────────────┬─┴──────────────────┘
//!                                 ▼
//!                          fusion::fuse (RRF)
//!                                 ▼
//!                       rerank::blend (cross-encoder)
//!                                 ▼
//!                   filter / dedup / project SearchResults
//!                                 ▼
//!                       answer::generate (optional)
//! ```
//!
//! Separately, [`backlog`] keeps the vector index consistent with chunks
//! that lack an up-to-date embedding for the active model.
//!
//! ## Modules
//!
//! | Module | Component | Purpose |
//! |--------|-----------|---------|
//! | [`score`] | C1 | Per-query min-max normalization, RRF contribution math |
//! | [`lang`] | C2 | BCP-47 language detection for prompt selection |
//! | [`chunklookup`] | C3 | O(1) `(mirror_hash, seq)` lookup over a batch-fetched map |
//! | [`expansion`] | C4 | LLM-driven query expansion with timeout and caching |
//! | [`retrieval_bm25`] | C5 | BM25 retrieval wrapping the store's FTS5 search |
//! | [`retrieval_vector`] | C6 | Vector (ANN) retrieval with contextual query prefixing |
//! | [`fusion`] | C7 | Weighted, tiered Reciprocal Rank Fusion |
//! | [`rerank`] | C8 | Cross-encoder reranking and positional score blending |
//! | [`orchestrator`] | C9 | Glues C2-C8 into the hybrid query pipeline |
//! | [`answer`] | C10 | Grounded-answer generation with citation renumbering |
//! | [`backlog`] | C11 | Embedding backlog worker (cursor pagination, batch upsert) |
//! | [`ports`] | §6 | Capability traits the pipeline consumes (store, vector index, LLM) |
//! | [`models`] | §3 | Core data types flowing through the pipeline |
//! | [`config`] | §10 | TOML configuration for retrieval/expansion/embedding tuning |
//! | [`error`] | §7 | The structured error boundary (`RetrievalError`) |
//!
//! ## Reference adapters
//!
//! The port traits above are implemented against SQLite + HTTP so the crate
//! is runnable end to end; a different deployment can swap these out without
//! touching the pipeline:
//!
//! | Module | Implements |
//! |--------|------------|
//! | [`store_sqlite`] | `StorePort`, `VectorIndexPort`, `VectorStatsPort` over SQLite FTS5 + blob vectors |
//! | [`embedding`] | The embedding provider backends (local ONNX, OpenAI-compatible HTTP) |
//! | [`embedding_port`] | Adapts [`embedding`] behind `EmbeddingPort` |
//! | [`generation`] | `GenerationPort` over an OpenAI-compatible chat completion API |
//! | [`db`] | SQLite connection pool (WAL mode) |
//! | [`migrate`] | Database schema migrations (idempotent) |
//!
//! ## Quick start
//!
//! ```bash
//! gr init                          # create database
//! gr embed pending                 # catch up the embedding backlog
//! gr search "deployment" --mode hybrid
//! gr ask "how do we deploy the staging cluster?"
//! ```

pub mod answer;
pub mod backlog;
pub mod chunklookup;
pub mod config;
pub mod db;
pub mod embedding;
pub mod embedding_port;
pub mod error;
pub mod expansion;
pub mod fusion;
pub mod generation;
pub mod lang;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod ports;
pub mod rerank;
pub mod retrieval_bm25;
pub mod retrieval_vector;
pub mod score;
pub mod store_sqlite;
