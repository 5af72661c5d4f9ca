//! Database schema migrations.
//!
//! Creates all required tables (documents, collections, tags, chunks,
//! chunks_fts, chunk_vectors, expansion_cache) and ensures idempotent
//! execution.

use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // One active logical document per (collection, rel_path); multiple
    // documents may point at the same mirror_hash.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            docid TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            rel_path TEXT NOT NULL,
            uri TEXT NOT NULL,
            title TEXT,
            mirror_hash TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            mime TEXT,
            ext TEXT,
            size INTEGER,
            mtime INTEGER,
            content_hash TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(collection, rel_path)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tags (
            document_id TEXT NOT NULL,
            tag TEXT NOT NULL,
            source TEXT NOT NULL,
            PRIMARY KEY (document_id, tag, source),
            FOREIGN KEY (document_id) REFERENCES documents(docid)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Chunks belong to a mirror_hash, not a docid: a mirror's chunks are
    // shared across every document whose content resolved to that hash.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            mirror_hash TEXT NOT NULL,
            seq INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_line INTEGER,
            end_line INTEGER,
            language TEXT,
            token_count INTEGER,
            PRIMARY KEY (mirror_hash, seq)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mirrors (
            mirror_hash TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(&pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                mirror_hash UNINDEXED,
                seq UNINDEXED,
                text
            )
            "#,
        )
        .execute(&pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            mirror_hash TEXT NOT NULL,
            seq INTEGER NOT NULL,
            model_uri TEXT NOT NULL,
            embedding BLOB NOT NULL,
            embedded_at INTEGER NOT NULL,
            PRIMARY KEY (mirror_hash, seq, model_uri)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Query expansion cache (C4): key is a SHA-256 hash over
    // prompt_version || model_uri || query || lang.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS expansion_cache (
            cache_key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_mirror_hash ON documents(mirror_hash)",
    )
    .execute(&pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_mirror_hash ON chunks(mirror_hash)")
        .execute(&pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_model ON chunk_vectors(model_uri, mirror_hash, seq)",
    )
    .execute(&pool)
    .await?;

    pool.close().await;
    Ok(())
}
