//! Embedding backlog worker (C11): cursor-based seek pagination over chunks
//! awaiting an embedding for a given model, batch embedding, batch vector
//! upsert. The cursor always advances, even when a batch fails outright, so
//! one bad batch cannot wedge the worker in a retry loop forever.

use crate::models::BacklogItem;
use crate::ports::{EmbeddingPort, VectorIndexPort, VectorStatsPort};

#[derive(Debug, Clone)]
pub struct BacklogOptions {
    pub batch_size: usize,
}

impl Default for BacklogOptions {
    fn default() -> Self {
        Self { batch_size: 64 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BacklogRunSummary {
    pub batches_processed: usize,
    pub items_embedded: usize,
    pub items_failed: usize,
}

/// Format the text handed to the embedder for one backlog item, matching the
/// convention this embedding model family expects: a title field (or the
/// literal `none`) followed by the chunk body.
fn format_embedding_input(item: &BacklogItem) -> String {
    let title = item.title.as_deref().unwrap_or("none");
    format!("title: {title} | text: {}", item.text)
}

/// Run one batch: fetch up to `opts.batch_size` backlog items after `cursor`,
/// embed them, and upsert the resulting vectors. Returns the next cursor
/// (`None` when the backlog is drained) and how many items were embedded vs.
/// failed in this batch.
///
/// If the embedder returns fewer vectors than items submitted, the whole
/// batch is treated as failed (no partial upsert) since there's no reliable
/// way to tell which item(s) the missing vectors belong to. The cursor still
/// advances past this batch.
pub async fn run_batch(
    stats: &dyn VectorStatsPort,
    vector_index: &dyn VectorIndexPort,
    embedder: &dyn EmbeddingPort,
    opts: &BacklogOptions,
    cursor: Option<(String, i64)>,
) -> anyhow::Result<(Option<(String, i64)>, usize, usize)> {
    let model_uri = embedder.model_uri();
    let items = stats.get_backlog(model_uri, opts.batch_size, cursor).await?;

    if items.is_empty() {
        return Ok((None, 0, 0));
    }

    let next_cursor = items
        .last()
        .map(|item| (item.mirror_hash.clone(), item.seq));

    let texts: Vec<String> = items.iter().map(format_embedding_input).collect();

    let vectors = match embedder.embed_batch(&texts).await {
        Ok(v) if v.len() == items.len() => v,
        Ok(_) => return Ok((next_cursor, 0, items.len())),
        Err(_) => return Ok((next_cursor, 0, items.len())),
    };

    let rows: Vec<(String, i64, Vec<f32>)> = items
        .iter()
        .zip(vectors)
        .map(|(item, vec)| (item.mirror_hash.clone(), item.seq, vec))
        .collect();

    match vector_index.upsert_vectors(&rows, model_uri).await {
        Ok(()) => Ok((next_cursor, items.len(), 0)),
        Err(_) => Ok((next_cursor, 0, items.len())),
    }
}

/// Drain the entire backlog for `embedder.model_uri()`, batch by batch,
/// stopping when a batch comes back empty.
pub async fn drain(
    stats: &dyn VectorStatsPort,
    vector_index: &dyn VectorIndexPort,
    embedder: &dyn EmbeddingPort,
    opts: &BacklogOptions,
) -> anyhow::Result<BacklogRunSummary> {
    let mut summary = BacklogRunSummary::default();
    let mut cursor: Option<(String, i64)> = None;

    loop {
        let (next_cursor, embedded, failed) =
            run_batch(stats, vector_index, embedder, opts, cursor.clone()).await?;

        if embedded == 0 && failed == 0 {
            break;
        }

        summary.batches_processed += 1;
        summary.items_embedded += embedded;
        summary.items_failed += failed;

        match next_cursor {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BacklogReason;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn item(hash: &str, seq: i64, title: Option<&str>, text: &str) -> BacklogItem {
        BacklogItem {
            mirror_hash: hash.to_string(),
            seq,
            title: title.map(|t| t.to_string()),
            text: text.to_string(),
            reason: BacklogReason::New,
        }
    }

    struct FakeEmbedder {
        dims: usize,
        fail: bool,
        short_by: usize,
    }

    #[async_trait]
    impl EmbeddingPort for FakeEmbedder {
        fn dimensions(&self) -> usize {
            self.dims
        }
        fn model_uri(&self) -> &str {
            "fake:v1"
        }
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![0.0; self.dims])
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if self.fail {
                anyhow::bail!("embedding failed");
            }
            let n = texts.len().saturating_sub(self.short_by);
            Ok((0..n).map(|_| vec![0.0; self.dims]).collect())
        }
    }

    struct FakeVectorIndex {
        fail_upsert: bool,
        upserted: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl VectorIndexPort for FakeVectorIndex {
        fn search_available(&self) -> bool {
            true
        }
        fn dimensions(&self) -> usize {
            3
        }
        fn model(&self) -> &str {
            "fake:v1"
        }
        async fn upsert_vectors(
            &self,
            rows: &[(String, i64, Vec<f32>)],
            _model_uri: &str,
        ) -> anyhow::Result<()> {
            if self.fail_upsert {
                anyhow::bail!("upsert failed");
            }
            let mut guard = self.upserted.lock().unwrap();
            for (hash, seq, _) in rows {
                guard.push((hash.clone(), *seq));
            }
            Ok(())
        }
        async fn search_nearest(
            &self,
            _query_vec: &[f32],
            _k: usize,
            _opts: &crate::ports::VectorSearchOpts,
        ) -> anyhow::Result<Vec<crate::ports::NearestVectorRow>> {
            Ok(vec![])
        }
    }

    struct FakeStats {
        all_items: Vec<BacklogItem>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VectorStatsPort for FakeStats {
        async fn count_backlog(&self, _model_uri: &str) -> anyhow::Result<usize> {
            Ok(self.all_items.len())
        }
        async fn get_backlog(
            &self,
            _model_uri: &str,
            limit: usize,
            after: Option<(String, i64)>,
        ) -> anyhow::Result<Vec<BacklogItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let start = match after {
                None => 0,
                Some((hash, seq)) => self
                    .all_items
                    .iter()
                    .position(|i| (i.mirror_hash.clone(), i.seq) == (hash, seq))
                    .map(|idx| idx + 1)
                    .unwrap_or(self.all_items.len()),
            };
            Ok(self.all_items[start..].iter().take(limit).cloned().collect())
        }
    }

    #[tokio::test]
    async fn test_drain_processes_all_items_across_batches() {
        let stats = FakeStats {
            all_items: vec![
                item("h1", 0, Some("Doc One"), "first chunk"),
                item("h1", 1, None, "second chunk"),
                item("h2", 0, Some("Doc Two"), "third chunk"),
            ],
            calls: AtomicUsize::new(0),
        };
        let embedder = FakeEmbedder { dims: 3, fail: false, short_by: 0 };
        let index = FakeVectorIndex { fail_upsert: false, upserted: Mutex::new(vec![]) };
        let opts = BacklogOptions { batch_size: 2 };

        let summary = drain(&stats, &index, &embedder, &opts).await.unwrap();

        assert_eq!(summary.items_embedded, 3);
        assert_eq!(summary.items_failed, 0);
        assert_eq!(summary.batches_processed, 2);
        assert_eq!(index.upserted.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cursor_advances_past_failed_batch() {
        let stats = FakeStats {
            all_items: vec![item("h1", 0, None, "a"), item("h2", 0, None, "b")],
            calls: AtomicUsize::new(0),
        };
        let embedder = FakeEmbedder { dims: 3, fail: true, short_by: 0 };
        let index = FakeVectorIndex { fail_upsert: false, upserted: Mutex::new(vec![]) };
        let opts = BacklogOptions { batch_size: 1 };

        let summary = drain(&stats, &index, &embedder, &opts).await.unwrap();

        // Both items attempted (cursor advanced past each failing batch),
        // both failed, nothing upserted.
        assert_eq!(summary.items_failed, 2);
        assert_eq!(summary.items_embedded, 0);
        assert_eq!(index.upserted.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_fewer_vectors_than_items_fails_whole_batch() {
        let stats = FakeStats {
            all_items: vec![item("h1", 0, None, "a"), item("h1", 1, None, "b")],
            calls: AtomicUsize::new(0),
        };
        let embedder = FakeEmbedder { dims: 3, fail: false, short_by: 1 };
        let index = FakeVectorIndex { fail_upsert: false, upserted: Mutex::new(vec![]) };
        let opts = BacklogOptions { batch_size: 10 };

        let (next_cursor, embedded, failed) =
            run_batch(&stats, &index, &embedder, &opts, None).await.unwrap();

        assert_eq!(embedded, 0);
        assert_eq!(failed, 2);
        assert_eq!(next_cursor, Some(("h1".to_string(), 1)));
        assert_eq!(index.upserted.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_empty_backlog_terminates_immediately() {
        let stats = FakeStats { all_items: vec![], calls: AtomicUsize::new(0) };
        let embedder = FakeEmbedder { dims: 3, fail: false, short_by: 0 };
        let index = FakeVectorIndex { fail_upsert: false, upserted: Mutex::new(vec![]) };
        let opts = BacklogOptions::default();

        let summary = drain(&stats, &index, &embedder, &opts).await.unwrap();
        assert_eq!(summary.batches_processed, 0);
        assert_eq!(stats.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upsert_failure_counts_as_failed_not_embedded() {
        let stats = FakeStats {
            all_items: vec![item("h1", 0, None, "a")],
            calls: AtomicUsize::new(0),
        };
        let embedder = FakeEmbedder { dims: 3, fail: false, short_by: 0 };
        let index = FakeVectorIndex { fail_upsert: true, upserted: Mutex::new(vec![]) };
        let opts = BacklogOptions::default();

        let summary = drain(&stats, &index, &embedder, &opts).await.unwrap();
        assert_eq!(summary.items_embedded, 0);
        assert_eq!(summary.items_failed, 1);
    }
}
