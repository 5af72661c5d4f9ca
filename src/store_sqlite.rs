//! Reference SQLite-backed implementation of the storage ports (§6, §10).
//!
//! Grounded on this codebase's own `db.rs` (WAL-mode pool) and the original
//! `search.rs`/`migrate.rs` FTS5/blob-vector schema, generalized to the
//! `(mirror_hash, seq)` chunk identity and the collections/tags/mirrors shape
//! added in the expanded data model. Swappable behind [`StorePort`] /
//! [`VectorIndexPort`] / [`VectorStatsPort`]; nothing upstream depends on
//! SQLite directly.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{BacklogItem, BacklogReason, Chunk, DocumentInfo, SourceMetadata, Tag, TagSource};
use crate::ports::{
    ExpansionCache, FtsRow, FtsSearchOpts, NearestVectorRow, StorePort, VectorIndexPort,
    VectorSearchOpts, VectorStatsPort,
};

/// Marker error distinguishing an FTS5 MATCH syntax error from any other
/// query failure, so the orchestrator can surface `RetrievalError::InvalidInput`
/// instead of `QueryFailed`.
#[derive(Debug)]
pub struct FtsSyntaxError(pub String);

impl fmt::Display for FtsSyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FTS5 query syntax error: {}", self.0)
    }
}

impl std::error::Error for FtsSyntaxError {}

fn looks_like_fts_syntax_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("fts5: syntax error") || lower.contains("malformed match")
}

pub struct SqliteStore {
    pool: SqlitePool,
    uri_scheme: String,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, uri_scheme: impl Into<String>) -> Self {
        Self {
            pool,
            uri_scheme: uri_scheme.into(),
        }
    }
}

fn row_to_document_info(row: &sqlx::sqlite::SqliteRow, uri_scheme: &str) -> DocumentInfo {
    let collection: String = row.get("collection");
    let rel_path: String = row.get("rel_path");
    DocumentInfo {
        docid: row.get("docid"),
        collection: collection.clone(),
        rel_path: rel_path.clone(),
        uri: crate::models::Document::build_uri(uri_scheme, &collection, &rel_path),
        title: row.get("title"),
        mirror_hash: row.get("mirror_hash"),
        active: row.get::<i64, _>("active") != 0,
        source_metadata: SourceMetadata {
            mime: row.get("mime"),
            ext: row.get("ext"),
            size: row.get("size"),
            mtime: row.get("mtime"),
            hash: row.get("content_hash"),
        },
    }
}

#[async_trait]
impl StorePort for SqliteStore {
    async fn get_collections(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM collections ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("name")).collect())
    }

    async fn list_documents(&self, collection: Option<&str>) -> anyhow::Result<Vec<DocumentInfo>> {
        let rows = match collection {
            Some(c) => {
                sqlx::query("SELECT * FROM documents WHERE active = 1 AND collection = ? ORDER BY docid")
                    .bind(c)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM documents WHERE active = 1 ORDER BY docid")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows
            .iter()
            .map(|r| row_to_document_info(r, &self.uri_scheme))
            .collect())
    }

    async fn get_document_by_docid(&self, docid: &str) -> anyhow::Result<Option<DocumentInfo>> {
        let row = sqlx::query("SELECT * FROM documents WHERE docid = ?")
            .bind(docid)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_document_info(&r, &self.uri_scheme)))
    }

    async fn get_content(&self, mirror_hash: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT content FROM mirrors WHERE mirror_hash = ?")
            .bind(mirror_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("content")))
    }

    async fn get_chunks(&self, mirror_hash: &str) -> anyhow::Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT mirror_hash, seq, text, start_line, end_line, language, token_count \
             FROM chunks WHERE mirror_hash = ? ORDER BY seq ASC",
        )
        .bind(mirror_hash)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn get_chunks_batch(
        &self,
        mirror_hashes: &[String],
    ) -> anyhow::Result<HashMap<String, Vec<Chunk>>> {
        let mut result: HashMap<String, Vec<Chunk>> = HashMap::new();
        if mirror_hashes.is_empty() {
            return Ok(result);
        }
        let placeholders = mirror_hashes.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT mirror_hash, seq, text, start_line, end_line, language, token_count \
             FROM chunks WHERE mirror_hash IN ({placeholders}) ORDER BY mirror_hash, seq"
        );
        let mut q = sqlx::query(&sql);
        for h in mirror_hashes {
            q = q.bind(h);
        }
        let rows = q.fetch_all(&self.pool).await?;
        for row in &rows {
            let chunk = row_to_chunk(row);
            result.entry(chunk.mirror_hash.clone()).or_default().push(chunk);
        }
        Ok(result)
    }

    async fn search_fts(&self, query: &str, opts: &FtsSearchOpts) -> anyhow::Result<Vec<FtsRow>> {
        let mut sql = String::from(
            "SELECT f.mirror_hash, f.seq, f.rank AS raw_rank, \
                    d.docid AS docid, d.uri AS uri, d.title AS title, \
                    d.collection AS collection, d.rel_path AS rel_path",
        );
        if opts.snippet {
            sql.push_str(", snippet(chunks_fts, 2, '>>>', '<<<', '...', 48) AS snippet");
        } else {
            sql.push_str(", NULL AS snippet");
        }
        sql.push_str(
            " FROM chunks_fts f \
              LEFT JOIN documents d ON d.mirror_hash = f.mirror_hash AND d.active = 1 \
              WHERE chunks_fts MATCH ?",
        );
        if opts.collection.is_some() {
            sql.push_str(" AND d.collection = ?");
        }
        if opts.language.is_some() {
            sql.push_str(" AND d.docid IN (SELECT document_id FROM tags WHERE tag = 'lang:' || ?)");
        }
        sql.push_str(" ORDER BY f.rank LIMIT ?");

        let mut q = sqlx::query(&sql).bind(query);
        if let Some(collection) = &opts.collection {
            q = q.bind(collection);
        }
        if let Some(language) = &opts.language {
            q = q.bind(language);
        }
        let result = q.bind(opts.limit).fetch_all(&self.pool).await;

        let rows = match result {
            Ok(r) => r,
            Err(sqlx::Error::Database(db_err)) if looks_like_fts_syntax_error(db_err.message()) => {
                return Err(anyhow::Error::new(FtsSyntaxError(db_err.message().to_string())));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(rows
            .iter()
            .map(|row| FtsRow {
                mirror_hash: row.get("mirror_hash"),
                seq: row.get("seq"),
                raw_score: row.get::<f64, _>("raw_rank"),
                uri: row.get("uri"),
                docid: row.get("docid"),
                title: row.get("title"),
                collection: row.get("collection"),
                rel_path: row.get("rel_path"),
                snippet: row.get("snippet"),
            })
            .collect())
    }

    async fn get_tags_batch(&self, docids: &[String]) -> anyhow::Result<HashMap<String, Vec<Tag>>> {
        let mut result: HashMap<String, Vec<Tag>> = HashMap::new();
        if docids.is_empty() {
            return Ok(result);
        }
        let placeholders = docids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT document_id, tag, source FROM tags WHERE document_id IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql);
        for d in docids {
            q = q.bind(d);
        }
        let rows = q.fetch_all(&self.pool).await?;
        for row in &rows {
            let docid: String = row.get("document_id");
            let source_str: String = row.get("source");
            let source = match source_str.as_str() {
                "user" => TagSource::User,
                _ => TagSource::Frontmatter,
            };
            result.entry(docid).or_default().push(Tag {
                name: row.get("tag"),
                source,
            });
        }
        Ok(result)
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        mirror_hash: row.get("mirror_hash"),
        seq: row.get("seq"),
        text: row.get("text"),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        language: row.get("language"),
        token_count: row.get("token_count"),
    }
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    model_uri: String,
    dims: usize,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool, model_uri: impl Into<String>, dims: usize) -> Self {
        Self {
            pool,
            model_uri: model_uri.into(),
            dims,
        }
    }
}

#[async_trait]
impl VectorIndexPort for SqliteVectorIndex {
    fn search_available(&self) -> bool {
        self.dims > 0
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn model(&self) -> &str {
        &self.model_uri
    }

    async fn upsert_vectors(
        &self,
        rows: &[(String, i64, Vec<f32>)],
        model_uri: &str,
    ) -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for (mirror_hash, seq, values) in rows {
            let blob = vec_to_blob(values);
            sqlx::query(
                "INSERT INTO chunk_vectors (mirror_hash, seq, model_uri, embedding, embedded_at) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(mirror_hash, seq, model_uri) DO UPDATE SET embedding = excluded.embedding, embedded_at = excluded.embedded_at",
            )
            .bind(mirror_hash)
            .bind(seq)
            .bind(model_uri)
            .bind(blob)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn search_nearest(
        &self,
        query_vec: &[f32],
        k: usize,
        opts: &VectorSearchOpts,
    ) -> anyhow::Result<Vec<NearestVectorRow>> {
        let rows = sqlx::query(
            "SELECT mirror_hash, seq, embedding FROM chunk_vectors WHERE model_uri = ?",
        )
        .bind(&self.model_uri)
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<NearestVectorRow> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let stored = blob_to_vec(&blob);
                let similarity = cosine_similarity(query_vec, &stored) as f64;
                let distance = 1.0 - similarity;
                NearestVectorRow {
                    mirror_hash: row.get("mirror_hash"),
                    seq: row.get("seq"),
                    distance,
                }
            })
            .collect();

        scored.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));

        if let Some(min_score) = opts.min_score {
            scored.retain(|r| crate::score::normalize_cosine_distance(r.distance) >= min_score);
        }

        scored.truncate(k);
        Ok(scored)
    }
}

#[async_trait]
impl VectorStatsPort for SqliteVectorIndex {
    async fn count_backlog(&self, model_uri: &str) -> anyhow::Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM chunks c \
             WHERE NOT EXISTS ( \
                SELECT 1 FROM chunk_vectors v \
                WHERE v.mirror_hash = c.mirror_hash AND v.seq = c.seq AND v.model_uri = ? \
             )",
        )
        .bind(model_uri)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn get_backlog(
        &self,
        model_uri: &str,
        limit: usize,
        after: Option<(String, i64)>,
    ) -> anyhow::Result<Vec<BacklogItem>> {
        let rows = match after {
            Some((after_hash, after_seq)) => {
                sqlx::query(
                    "SELECT c.mirror_hash, c.seq, c.text, d.title AS title \
                     FROM chunks c \
                     LEFT JOIN documents d ON d.mirror_hash = c.mirror_hash AND d.active = 1 \
                     WHERE NOT EXISTS ( \
                        SELECT 1 FROM chunk_vectors v \
                        WHERE v.mirror_hash = c.mirror_hash AND v.seq = c.seq AND v.model_uri = ? \
                     ) \
                     AND (c.mirror_hash, c.seq) > (?, ?) \
                     ORDER BY c.mirror_hash, c.seq \
                     LIMIT ?",
                )
                .bind(model_uri)
                .bind(after_hash)
                .bind(after_seq)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT c.mirror_hash, c.seq, c.text, d.title AS title \
                     FROM chunks c \
                     LEFT JOIN documents d ON d.mirror_hash = c.mirror_hash AND d.active = 1 \
                     WHERE NOT EXISTS ( \
                        SELECT 1 FROM chunk_vectors v \
                        WHERE v.mirror_hash = c.mirror_hash AND v.seq = c.seq AND v.model_uri = ? \
                     ) \
                     ORDER BY c.mirror_hash, c.seq \
                     LIMIT ?",
                )
                .bind(model_uri)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| BacklogItem {
                mirror_hash: row.get("mirror_hash"),
                seq: row.get("seq"),
                title: row.get("title"),
                text: row.get("text"),
                reason: BacklogReason::New,
            })
            .collect())
    }
}

/// SQLite-backed [`ExpansionCache`]: a single key/value table keyed by the
/// hash C4 computes over `(prompt_version, model_uri, query, lang)`. Reads
/// and writes are plain statements; concurrent writers racing on the same
/// key simply overwrite each other, which is fine since entries are
/// value-stable for a given key.
pub struct SqliteExpansionCache {
    pool: SqlitePool,
}

impl SqliteExpansionCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExpansionCache for SqliteExpansionCache {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM expansion_cache WHERE cache_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO expansion_cache (cache_key, value, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(cache_key) DO UPDATE SET value = excluded.value, created_at = excluded.created_at",
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn memory_pool() -> SqlitePool {
        let db_file = tempfile::NamedTempFile::new().unwrap();
        let db_path = db_file.path().to_string_lossy().replace('\\', "/");
        let cfg_toml = format!("[db]\npath = \"{db_path}\"\n");
        let cfg_file = {
            use std::io::Write;
            let mut f = tempfile::NamedTempFile::new().unwrap();
            write!(f, "{}", cfg_toml).unwrap();
            f
        };
        let config: Config = crate::config::load_config(cfg_file.path()).unwrap();
        crate::migrate::run_migrations(&config).await.unwrap();
        crate::db::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_expansion_cache_round_trips() {
        let pool = memory_pool().await;
        let cache = SqliteExpansionCache::new(pool);

        assert_eq!(cache.get("k1").await.unwrap(), None);
        cache.set("k1", "{\"lexicalQueries\":[]}").await.unwrap();
        assert_eq!(
            cache.get("k1").await.unwrap(),
            Some("{\"lexicalQueries\":[]}".to_string())
        );
    }

    #[tokio::test]
    async fn test_expansion_cache_overwrites_on_set() {
        let pool = memory_pool().await;
        let cache = SqliteExpansionCache::new(pool);

        cache.set("k1", "v1").await.unwrap();
        cache.set("k1", "v2").await.unwrap();
        assert_eq!(cache.get("k1").await.unwrap(), Some("v2".to_string()));
    }
}
