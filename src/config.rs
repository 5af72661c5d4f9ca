//! Configuration parsing and validation.
//!
//! The engine is configured via a TOML file (default: `config/gr.toml`).
//! The config defines the database path, retrieval/fusion/rerank tuning,
//! query expansion settings, and the embedding provider.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Tuning knobs for C1/C5-C9: fusion weights, rerank tiers, strong-BM25 detection.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    #[serde(default = "default_w_bm25")]
    pub w_bm25: f64,
    #[serde(default = "default_w_vec")]
    pub w_vec: f64,
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_top_rank_bonus")]
    pub top_rank_bonus: f64,
    #[serde(default = "default_top_rank_threshold")]
    pub top_rank_threshold: usize,
    #[serde(default = "default_rerank_max_candidates")]
    pub rerank_max_candidates: usize,
    #[serde(default = "default_tag_filter_k_multiplier")]
    pub tag_filter_k_multiplier: i64,
    #[serde(default = "default_strong_bm25_score")]
    pub strong_bm25_score: f64,
    #[serde(default = "default_strong_bm25_gap")]
    pub strong_bm25_gap: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: default_final_limit(),
            w_bm25: default_w_bm25(),
            w_vec: default_w_vec(),
            rrf_k: default_rrf_k(),
            top_rank_bonus: default_top_rank_bonus(),
            top_rank_threshold: default_top_rank_threshold(),
            rerank_max_candidates: default_rerank_max_candidates(),
            tag_filter_k_multiplier: default_tag_filter_k_multiplier(),
            strong_bm25_score: default_strong_bm25_score(),
            strong_bm25_gap: default_strong_bm25_gap(),
        }
    }
}

fn default_final_limit() -> i64 {
    12
}
fn default_w_bm25() -> f64 {
    1.0
}
fn default_w_vec() -> f64 {
    1.0
}
fn default_rrf_k() -> f64 {
    60.0
}
fn default_top_rank_bonus() -> f64 {
    0.1
}
fn default_top_rank_threshold() -> usize {
    5
}
fn default_rerank_max_candidates() -> usize {
    20
}
fn default_tag_filter_k_multiplier() -> i64 {
    3
}
fn default_strong_bm25_score() -> f64 {
    0.84
}
fn default_strong_bm25_gap() -> f64 {
    0.14
}

/// Tuning knobs for C4 query expansion.
#[derive(Debug, Deserialize, Clone)]
pub struct ExpansionConfig {
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_max_variants")]
    pub max_variants: usize,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            prompt_version: default_prompt_version(),
            timeout_ms: default_timeout_ms(),
            cache_enabled: true,
            max_variants: default_max_variants(),
        }
    }
}

fn default_prompt_version() -> String {
    "v1".to_string()
}
fn default_timeout_ms() -> u64 {
    4000
}
fn default_max_variants() -> usize {
    5
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Tuning for C4/C10's generation port (query expansion, grounded answers).
#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_answer_max_tokens")]
    pub answer_max_tokens: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            model: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            answer_max_tokens: default_answer_max_tokens(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_generation_provider() -> String {
    "disabled".to_string()
}
fn default_answer_max_tokens() -> usize {
    512
}

/// Tuning for C8's cross-encoder reranker.
#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    #[serde(default = "default_rerank_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            provider: default_rerank_provider(),
            model: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl RerankConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_rerank_provider() -> String {
    "disabled".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate retrieval
    if config.retrieval.final_limit < 1 {
        anyhow::bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.w_bm25 < 0.0 || config.retrieval.w_vec < 0.0 {
        anyhow::bail!("retrieval.w_bm25 and retrieval.w_vec must be >= 0.0");
    }
    if config.retrieval.rrf_k <= 0.0 {
        anyhow::bail!("retrieval.rrf_k must be > 0.0");
    }
    if !(0.0..=1.0).contains(&config.retrieval.strong_bm25_score) {
        anyhow::bail!("retrieval.strong_bm25_score must be in [0.0, 1.0]");
    }

    // Validate expansion
    if config.expansion.timeout_ms == 0 {
        anyhow::bail!("expansion.timeout_ms must be > 0");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    // Validate generation (C4 expansion prompts, C10 grounded answers)
    if config.generation.is_enabled() && config.generation.model.is_none() {
        anyhow::bail!(
            "generation.model must be specified when provider is '{}'",
            config.generation.provider
        );
    }
    match config.generation.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown generation provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Validate rerank (C8 cross-encoder)
    if config.rerank.is_enabled() && config.rerank.model.is_none() {
        anyhow::bail!(
            "rerank.model must be specified when provider is '{}'",
            config.rerank.provider
        );
    }
    match config.rerank.provider.as_str() {
        "disabled" | "http" => {}
        other => anyhow::bail!("Unknown rerank provider: '{}'. Must be disabled or http.", other),
    }

    Ok(config)
}
