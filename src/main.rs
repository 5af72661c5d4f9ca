//! `gr` — a local-first hybrid retrieval and grounded-question-answering CLI
//! over a user's own corpora.
//!
//! This binary wires the reference SQLite/HTTP adapters behind the port
//! traits the pipeline consumes ([`grounded_retrieve::ports`]) and exposes
//! them as a handful of subcommands. The retrieval core itself
//! ([`grounded_retrieve::orchestrator`] and friends) is a library surface;
//! this file is the thinnest possible shell around it.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use grounded_retrieve::answer;
use grounded_retrieve::backlog::{self, BacklogOptions};
use grounded_retrieve::config::{self, Config};
use grounded_retrieve::db;
use grounded_retrieve::embedding_port::ConfiguredEmbedder;
use grounded_retrieve::generation::OpenAiGenerator;
use grounded_retrieve::migrate;
use grounded_retrieve::models::SearchResults;
use grounded_retrieve::orchestrator::{self, Dependencies, QueryOptions};
use grounded_retrieve::ports::{
    EmbeddingPort, ExpansionCache, GenerationPort, RerankPort, RetrievalFilters, StorePort,
    VectorIndexPort,
};
use grounded_retrieve::rerank::HttpReranker;
use grounded_retrieve::store_sqlite::{SqliteExpansionCache, SqliteStore, SqliteVectorIndex};

#[derive(Parser)]
#[command(
    name = "gr",
    about = "A local-first hybrid retrieval and grounded-question-answering engine",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/gr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Init,

    /// Run a hybrid (BM25 + vector) search over the indexed corpus
    Search {
        /// Search query
        query: String,

        /// Restrict to a single collection
        #[arg(long)]
        collection: Option<String>,

        /// Restrict results to an exact chunk language (BCP-47)
        #[arg(long)]
        lang: Option<String>,

        /// Require every tag to be present
        #[arg(long = "tag-all")]
        tags_all: Vec<String>,

        /// Require at least one of these tags
        #[arg(long = "tag-any")]
        tags_any: Vec<String>,

        /// Maximum number of results
        #[arg(long)]
        limit: Option<i64>,

        /// Return whole-document content instead of the matching chunk
        #[arg(long)]
        full: bool,

        /// Drop results below this normalized score
        #[arg(long, default_value_t = 0.0)]
        min_score: f64,

        /// Emit the per-stage explain trace alongside results
        #[arg(long)]
        explain: bool,
    },

    /// Run a grounded search-then-answer query, with renumbered citations
    Ask {
        /// Question to answer
        query: String,

        /// Restrict to a single collection
        #[arg(long)]
        collection: Option<String>,
    },

    /// Manage the embedding backlog
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed chunks that are missing or have stale embeddings
    Pending {
        /// Override batch size from config
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

/// Everything an invocation needs, assembled once from config. Ports the
/// config leaves disabled stay `None`; the orchestrator degrades gracefully
/// around their absence (§7).
struct Runtime {
    config: Config,
    store: SqliteStore,
    vector_index: Option<SqliteVectorIndex>,
    embedder: Option<ConfiguredEmbedder>,
    generation: Option<OpenAiGenerator>,
    reranker: Option<HttpReranker>,
    expansion_cache: Option<SqliteExpansionCache>,
}

impl Runtime {
    async fn assemble(config_path: &PathBuf) -> anyhow::Result<Self> {
        let config = config::load_config(config_path)?;
        let pool = db::connect(&config).await?;
        let store = SqliteStore::new(pool.clone(), "gr");

        let vector_index = if config.embedding.is_enabled() {
            let dims = config.embedding.dims.unwrap_or(0);
            let model_uri = format!(
                "{}:{}",
                config.embedding.provider,
                config.embedding.model.clone().unwrap_or_default()
            );
            Some(SqliteVectorIndex::new(pool.clone(), model_uri, dims))
        } else {
            None
        };

        let embedder = if config.embedding.is_enabled() {
            Some(ConfiguredEmbedder::new(config.embedding.clone())?)
        } else {
            None
        };

        let generation = if config.generation.is_enabled() {
            Some(OpenAiGenerator::new(
                config.generation.model.clone().unwrap_or_default(),
                config.generation.timeout_secs,
                config.generation.max_retries,
            )?)
        } else {
            None
        };

        let reranker = if config.rerank.is_enabled() {
            Some(HttpReranker::new(
                config.rerank.model.clone().unwrap_or_default(),
                config.rerank.timeout_secs,
                config.rerank.max_retries,
            )?)
        } else {
            None
        };

        let expansion_cache = if config.expansion.cache_enabled {
            Some(SqliteExpansionCache::new(pool))
        } else {
            None
        };

        Ok(Self {
            config,
            store,
            vector_index,
            embedder,
            generation,
            reranker,
            expansion_cache,
        })
    }

    fn dependencies(&self) -> Dependencies<'_> {
        Dependencies {
            store: &self.store as &dyn StorePort,
            vector_index: self.vector_index.as_ref().map(|v| v as &dyn VectorIndexPort),
            embedder: self.embedder.as_ref().map(|e| e as &dyn EmbeddingPort),
            generation: self.generation.as_ref().map(|g| g as &dyn GenerationPort),
            expansion_cache: self.expansion_cache.as_ref().map(|c| c as &dyn ExpansionCache),
            reranker: self.reranker.as_ref().map(|r| r as &dyn RerankPort),
        }
    }
}

fn print_results(results: &SearchResults) {
    println!(
        "mode={} expanded={} reranked={} vectors_used={} total={}",
        results.meta.mode,
        results.meta.expanded,
        results.meta.reranked,
        results.meta.vectors_used,
        results.meta.total_results
    );
    for (i, r) in results.results.iter().enumerate() {
        println!(
            "{:>2}. [{:.3}] {} — {}",
            i + 1,
            r.score,
            r.uri,
            r.title.as_deref().unwrap_or("(untitled)")
        );
        println!("    {}", r.snippet.chars().take(200).collect::<String>());
    }
    if let Some(explain) = &results.meta.explain {
        println!("\nexplain:");
        for line in explain {
            println!("  {line}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Init => {
            let config = config::load_config(&cli.config)?;
            migrate::run_migrations(&config).await?;
            println!("Database initialized successfully.");
        }
        Commands::Search {
            query,
            collection,
            lang,
            tags_all,
            tags_any,
            limit,
            full,
            min_score,
            explain,
        } => {
            let runtime = Runtime::assemble(&cli.config).await?;
            let deps = runtime.dependencies();
            let opts = QueryOptions {
                lang_hint: None,
                filters: RetrievalFilters {
                    collection: collection.clone(),
                    lang: lang.clone(),
                    tags_all: tags_all.clone(),
                    tags_any: tags_any.clone(),
                },
                full_mode: *full,
                limit: *limit,
                explain: *explain,
            };
            let mut results = orchestrator::search(&deps, query, &opts, &runtime.config).await?;
            results.results.retain(|r| r.score >= *min_score);
            print_results(&results);
        }
        Commands::Ask { query, collection } => {
            let runtime = Runtime::assemble(&cli.config).await?;
            let deps = runtime.dependencies();
            let opts = QueryOptions {
                lang_hint: None,
                filters: RetrievalFilters {
                    collection: collection.clone(),
                    ..Default::default()
                },
                full_mode: false,
                limit: Some(5),
                explain: false,
            };
            let results = orchestrator::search(&deps, query, &opts, &runtime.config).await?;

            let Some(generation) = deps.generation else {
                println!(
                    "No generation port configured; set [generation].provider in config to enable `ask`."
                );
                return Ok(());
            };

            // `answer::generate` takes a synchronous content lookup, so the
            // handful of mirrors it might need are pre-fetched here.
            let mut content_by_hash: HashMap<String, String> = HashMap::new();
            for r in results.results.iter().take(3) {
                if let Some(conv) = &r.conversion {
                    if !content_by_hash.contains_key(&conv.mirror_hash) {
                        if let Ok(Some(content)) = deps.store.get_content(&conv.mirror_hash).await {
                            content_by_hash.insert(conv.mirror_hash.clone(), content);
                        }
                    }
                }
            }
            let get_content = |mirror_hash: &str| content_by_hash.get(mirror_hash).cloned();
            let get_content_ref: &dyn Fn(&str) -> Option<String> = &get_content;

            let answer = answer::generate(
                generation,
                query,
                &results.results,
                runtime.config.generation.answer_max_tokens,
                Some(get_content_ref),
            )
            .await;

            match answer {
                Some(a) => {
                    println!("{}\n", a.answer);
                    for (i, c) in a.citations.iter().enumerate() {
                        match (c.start_line, c.end_line) {
                            (Some(s), Some(e)) => {
                                println!("[{}] {} (lines {}-{})", i + 1, c.uri, s, e)
                            }
                            _ => println!("[{}] {}", i + 1, c.uri),
                        }
                    }
                }
                None => println!("Generation failed; no answer produced."),
            }
        }
        Commands::Embed { action } => match action {
            EmbedAction::Pending { batch_size } => {
                let runtime = Runtime::assemble(&cli.config).await?;
                let (Some(vector_index), Some(embedder)) =
                    (runtime.vector_index.as_ref(), runtime.embedder.as_ref())
                else {
                    anyhow::bail!(
                        "embedding.provider must be enabled in config to run `embed pending`"
                    );
                };
                let opts = BacklogOptions {
                    batch_size: batch_size.unwrap_or(runtime.config.embedding.batch_size),
                };
                let summary = backlog::drain(vector_index, vector_index, embedder, &opts).await?;
                println!(
                    "batches={} embedded={} errors={}",
                    summary.batches_processed, summary.items_embedded, summary.items_failed
                );
            }
        },
    }

    Ok(())
}
