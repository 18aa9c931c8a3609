//! Chunk creation and atomic per-file persistence.
//!
//! Phase 1 turns a file's blocks into provisional chunks under one fresh
//! `source_id` and runs them through segmentation/embedding. Phase 2
//! commits the finalized list in ordinal-ordered batches; retries happen
//! per batch through the Error Handler, and once a batch fails for good,
//! compensation (`delete_by_source`) removes everything already written
//! so the store never shows a partial file.

use serde_json::{Value, json};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::config::ChunkingConfig;
use crate::facade::VectorStore;
use crate::models::{Block, Chunk, ChunkStatus, ErrorKind, FileRecord, ProcessingError, Stage};
use crate::retry::ErrorHandler;

/// A file's finalized chunks, ready for commit.
#[derive(Debug)]
pub struct PreparedFile {
    pub source_id: String,
    pub chunks: Vec<Chunk>,
}

/// Drives both phases for one file at a time.
pub struct ChunkingManager<'a> {
    facade: &'a dyn VectorStore,
    config: ChunkingConfig,
}

impl<'a> ChunkingManager<'a> {
    pub fn new(facade: &'a dyn VectorStore, config: ChunkingConfig) -> Self {
        Self { facade, config }
    }

    /// Phase 1: provisional chunks → segmentation/embedding → validated
    /// finalized list. Allocates the file's `source_id`. Nothing is
    /// written upstream in this phase, so failure needs no compensation.
    pub async fn prepare(
        &self,
        file: &FileRecord,
        blocks: &[Block],
        handler: &ErrorHandler,
    ) -> Result<PreparedFile, ProcessingError> {
        let source_id = Uuid::new_v4().to_string();
        let source_path = file.path.to_string_lossy().into_owned();

        let mut provisional = Vec::new();
        for block in blocks {
            for piece in split_body(&block.body, self.config.max_block_size) {
                provisional.push(Chunk {
                    source_path: source_path.clone(),
                    source_id: source_id.clone(),
                    body: piece,
                    status: ChunkStatus::New,
                    ordinal: provisional.len() as u32,
                    metadata: block_metadata(block),
                });
            }
        }

        let finalized = handler
            .run(Stage::Embedding, |_| {
                let chunks = provisional.clone();
                async move {
                    self.facade.prepare_chunks(chunks).await.map_err(|e| {
                        ProcessingError::new(e.kind(), Stage::Embedding, e.to_string())
                            .with_file(&file.path)
                    })
                }
            })
            .await?;

        // Everything that goes to the store must hold the invariants,
        // including chunks the segmentation service derived.
        for chunk in &finalized {
            if let Err(detail) = chunk.validate() {
                return Err(ProcessingError::new(ErrorKind::Rejected, Stage::Chunking, detail)
                    .with_file(&file.path));
            }
            if chunk.source_id != source_id {
                return Err(ProcessingError::new(
                    ErrorKind::Rejected,
                    Stage::Chunking,
                    format!(
                        "chunk carries foreign source_id {} (expected {})",
                        chunk.source_id, source_id
                    ),
                )
                .with_file(&file.path));
            }
        }

        Ok(PreparedFile {
            source_id,
            chunks: finalized,
        })
    }

    /// Phase 2: commit in ordinal order, batch-capped, all-or-nothing per
    /// file. A batch that fails past its retry budget, or a cancellation
    /// observed between batches, triggers compensation before the error
    /// surfaces.
    pub async fn commit(
        &self,
        prepared: &PreparedFile,
        handler: &ErrorHandler,
        cancel: &CancelFlag,
    ) -> Result<u64, ProcessingError> {
        let mut committed = 0u64;

        for batch in prepared.chunks.chunks(self.config.max_blocks_per_batch) {
            if cancel.is_set() {
                self.compensate(&prepared.source_id).await;
                return Err(ProcessingError::new(
                    ErrorKind::Cancelled,
                    Stage::Committing,
                    "stop requested mid-commit",
                ));
            }

            // Racing against the flag drops the in-flight HTTP call (and
            // any backoff sleep) the moment a stop arrives.
            let outcome = tokio::select! {
                outcome = handler.run(Stage::Committing, |_| async move {
                    self.facade.commit_chunks(batch).await.map_err(|e| {
                        ProcessingError::new(e.kind(), Stage::Committing, e.to_string())
                    })
                }) => outcome,
                _ = cancel.cancelled() => Err(ProcessingError::new(
                    ErrorKind::Cancelled,
                    Stage::Committing,
                    "stop requested mid-commit",
                )),
            };

            match outcome {
                Ok(receipt) => {
                    // The store must take the whole batch; an undercount
                    // would leave a partial file visible, so it is
                    // compensated like any other batch failure.
                    if receipt.created != batch.len() as u64 {
                        self.compensate(&prepared.source_id).await;
                        return Err(ProcessingError::new(
                            ErrorKind::PartialFailure,
                            Stage::Committing,
                            format!(
                                "batch reported {} of {} chunks created",
                                receipt.created,
                                batch.len()
                            ),
                        ));
                    }
                    committed += receipt.created;
                }
                Err(e) => {
                    self.compensate(&prepared.source_id).await;
                    return Err(e);
                }
            }
        }

        info!(
            source_id = %prepared.source_id,
            chunks = committed,
            "file committed"
        );
        Ok(committed)
    }

    /// Remove every chunk already written for `source_id`. Failure here
    /// is logged, not surfaced: the original commit error wins.
    pub async fn compensate(&self, source_id: &str) {
        match self.facade.delete_by_source(source_id).await {
            Ok(deleted) => {
                if deleted > 0 {
                    info!(source_id, deleted, "compensated partial commit");
                }
            }
            Err(e) => {
                warn!(source_id, error = %e, "compensation failed; chunks may linger");
            }
        }
    }
}

fn block_metadata(block: &Block) -> serde_json::Map<String, Value> {
    let mut metadata = block.attributes.clone();
    metadata.insert("kind".to_string(), json!(block.kind));
    metadata.insert("start_line".to_string(), json!(block.start_line));
    metadata.insert("end_line".to_string(), json!(block.end_line));
    metadata.insert("start_byte".to_string(), json!(block.start_byte));
    metadata.insert("end_byte".to_string(), json!(block.end_byte));
    if let Some(title) = &block.title {
        metadata.insert("title".to_string(), json!(title));
    }
    metadata
}

/// Split `body` into pieces no longer than `max` bytes, preferring line
/// then word boundaries, never splitting inside a UTF-8 sequence.
fn split_body(body: &str, max: usize) -> Vec<String> {
    if body.len() <= max {
        return vec![body.to_string()];
    }

    let mut pieces = Vec::new();
    let mut rest = body;
    while rest.len() > max {
        let window = floor_char_boundary(rest, max);
        let cut = rest[..window]
            .rfind('\n')
            .or_else(|| rest[..window].rfind(' '))
            .map(|i| i + 1)
            .unwrap_or(window);

        let (piece, tail) = rest.split_at(cut);
        let piece = piece.trim_end();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        rest = tail.trim_start_matches('\n');
    }
    let rest = rest.trim_end();
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::facade::{CommitReceipt, FacadeError, HealthReport};
    use crate::models::{BlockKind, IndexedFileRecord};
    use crate::retry::RetryPolicy;

    /// Scripted fake: fails the nth commit batch, records deletions.
    struct ScriptedStore {
        commits: Mutex<Vec<Vec<Chunk>>>,
        deleted: Mutex<Vec<String>>,
        fail_from_batch: Option<usize>,
        partial_batch: Option<usize>,
    }

    impl ScriptedStore {
        fn ok() -> Self {
            Self {
                commits: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
                fail_from_batch: None,
                partial_batch: None,
            }
        }
    }

    #[async_trait]
    impl VectorStore for ScriptedStore {
        async fn list_files(&self, _dir: &Path) -> Result<Vec<IndexedFileRecord>, FacadeError> {
            Ok(Vec::new())
        }

        async fn prepare_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<Chunk>, FacadeError> {
            Ok(chunks)
        }

        async fn commit_chunks(&self, chunks: &[Chunk]) -> Result<CommitReceipt, FacadeError> {
            let batch_no = self.commits.lock().unwrap().len();
            if self.fail_from_batch.is_some_and(|n| batch_no >= n) {
                return Err(FacadeError::Unavailable {
                    service: "vector_store",
                    detail: "503".into(),
                });
            }
            if self.partial_batch == Some(batch_no) {
                self.commits.lock().unwrap().push(chunks.to_vec());
                return Ok(CommitReceipt {
                    created: chunks.len() as u64 - 1,
                    ids: Vec::new(),
                });
            }
            self.commits.lock().unwrap().push(chunks.to_vec());
            Ok(CommitReceipt {
                created: chunks.len() as u64,
                ids: Vec::new(),
            })
        }

        async fn delete_by_source(&self, source_id: &str) -> Result<u64, FacadeError> {
            self.deleted.lock().unwrap().push(source_id.to_string());
            Ok(1)
        }

        async fn health(&self) -> HealthReport {
            HealthReport::new()
        }
    }

    fn file() -> FileRecord {
        FileRecord {
            path: "/tmp/docs/a.md".into(),
            size: 100,
            modified_at: chrono::Utc::now(),
            extension: "md".into(),
            content_hash: None,
        }
    }

    fn blocks(n: usize) -> Vec<Block> {
        (0..n)
            .map(|i| Block {
                body: format!("block {i}"),
                kind: BlockKind::Paragraph,
                start_byte: i * 10,
                end_byte: i * 10 + 7,
                start_line: i as u32 + 1,
                end_line: i as u32 + 1,
                ordinal: i as u32,
                title: None,
                attributes: serde_json::Map::new(),
            })
            .collect()
    }

    fn config(batch: usize) -> ChunkingConfig {
        ChunkingConfig {
            max_block_size: 1000,
            max_blocks_per_batch: batch,
        }
    }

    fn handler() -> ErrorHandler {
        ErrorHandler::new(RetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
            3,
        ))
    }

    #[tokio::test]
    async fn test_prepare_shares_one_source_id() {
        let store = ScriptedStore::ok();
        let manager = ChunkingManager::new(&store, config(100));

        let prepared = manager
            .prepare(&file(), &blocks(5), &handler())
            .await
            .unwrap();
        assert_eq!(prepared.chunks.len(), 5);

        let id = Uuid::parse_str(&prepared.source_id).unwrap();
        assert_eq!(id.get_version_num(), 4);
        assert!(
            prepared
                .chunks
                .iter()
                .all(|c| c.source_id == prepared.source_id)
        );
        assert!(
            prepared
                .chunks
                .iter()
                .all(|c| c.source_path == "/tmp/docs/a.md")
        );
    }

    #[tokio::test]
    async fn test_prepare_fresh_id_per_call() {
        let store = ScriptedStore::ok();
        let manager = ChunkingManager::new(&store, config(100));

        let a = manager.prepare(&file(), &blocks(1), &handler()).await.unwrap();
        let b = manager.prepare(&file(), &blocks(1), &handler()).await.unwrap();
        assert_ne!(a.source_id, b.source_id);
    }

    #[tokio::test]
    async fn test_commit_batches_in_order() {
        let store = ScriptedStore::ok();
        let manager = ChunkingManager::new(&store, config(2));
        let h = handler();

        let prepared = manager.prepare(&file(), &blocks(5), &h).await.unwrap();
        let committed = manager
            .commit(&prepared, &h, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(committed, 5);

        let commits = store.commits.lock().unwrap();
        assert_eq!(commits.len(), 3);
        let ordinals: Vec<u32> = commits.iter().flatten().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failed_batch_retries_then_compensates_once() {
        let store = ScriptedStore {
            fail_from_batch: Some(1),
            ..ScriptedStore::ok()
        };
        let manager = ChunkingManager::new(&store, config(2));
        let h = handler();

        let prepared = manager.prepare(&file(), &blocks(5), &h).await.unwrap();
        let err = manager
            .commit(&prepared, &h, &CancelFlag::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::UpstreamUnavailable);
        // Retries were exhausted on the second batch.
        assert_eq!(err.attempt, 3);
        // Exactly one compensation call, after the retry budget ran out.
        let deleted = store.deleted.lock().unwrap();
        assert_eq!(deleted.as_slice(), [prepared.source_id.clone()]);
    }

    #[tokio::test]
    async fn test_partial_batch_compensates() {
        let store = ScriptedStore {
            partial_batch: Some(0),
            ..ScriptedStore::ok()
        };
        let manager = ChunkingManager::new(&store, config(10));
        let h = handler();

        let prepared = manager.prepare(&file(), &blocks(3), &h).await.unwrap();
        let err = manager
            .commit(&prepared, &h, &CancelFlag::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PartialFailure);
        assert_eq!(store.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_between_batches_compensates() {
        let store = ScriptedStore::ok();
        let manager = ChunkingManager::new(&store, config(2));
        let h = handler();
        let cancel = CancelFlag::new();
        cancel.set();

        let prepared = manager.prepare(&file(), &blocks(4), &h).await.unwrap();
        let err = manager.commit(&prepared, &h, &cancel).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert_eq!(store.deleted.lock().unwrap().len(), 1);
        assert!(store.commits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversize_block_is_split() {
        let store = ScriptedStore::ok();
        let manager = ChunkingManager::new(
            &store,
            ChunkingConfig {
                max_block_size: 16,
                max_blocks_per_batch: 100,
            },
        );

        let mut bs = blocks(1);
        bs[0].body = "alpha beta gamma delta epsilon".to_string();
        let prepared = manager.prepare(&file(), &bs, &handler()).await.unwrap();

        assert!(prepared.chunks.len() > 1);
        assert!(prepared.chunks.iter().all(|c| c.body.len() <= 16));
        let joined: String = prepared
            .chunks
            .iter()
            .map(|c| c.body.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        assert!(joined.contains("alpha"));
        assert!(joined.contains("epsilon"));
    }

    #[tokio::test]
    async fn test_chunks_carry_block_metadata() {
        let store = ScriptedStore::ok();
        let manager = ChunkingManager::new(&store, config(10));

        let mut bs = blocks(1);
        bs[0].title = Some("Intro".to_string());
        bs[0].attributes
            .insert("level".to_string(), serde_json::json!(2));

        let prepared = manager.prepare(&file(), &bs, &handler()).await.unwrap();
        let meta = &prepared.chunks[0].metadata;
        assert_eq!(meta["title"], "Intro");
        assert_eq!(meta["level"], 2);
        assert_eq!(meta["start_line"], 1);
    }

    #[tokio::test]
    async fn test_foreign_source_id_rejected() {
        struct Tamper;

        #[async_trait]
        impl VectorStore for Tamper {
            async fn list_files(
                &self,
                _dir: &Path,
            ) -> Result<Vec<IndexedFileRecord>, FacadeError> {
                Ok(Vec::new())
            }

            async fn prepare_chunks(
                &self,
                mut chunks: Vec<Chunk>,
            ) -> Result<Vec<Chunk>, FacadeError> {
                chunks[0].source_id = Uuid::new_v4().to_string();
                Ok(chunks)
            }

            async fn commit_chunks(
                &self,
                _chunks: &[Chunk],
            ) -> Result<CommitReceipt, FacadeError> {
                unreachable!("prepare must fail first")
            }

            async fn delete_by_source(&self, _source_id: &str) -> Result<u64, FacadeError> {
                Ok(0)
            }

            async fn health(&self) -> HealthReport {
                HealthReport::new()
            }
        }

        let manager = ChunkingManager::new(&Tamper, config(10));
        let err = manager
            .prepare(&file(), &blocks(1), &handler())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Rejected);
    }

    #[test]
    fn test_split_body_utf8_safe() {
        let body = "é".repeat(40);
        let pieces = split_body(&body, 15);
        assert!(pieces.iter().all(|p| p.len() <= 15));
        assert_eq!(pieces.concat(), body);
    }

    #[test]
    fn test_split_body_short_passthrough() {
        assert_eq!(split_body("short", 100), vec!["short".to_string()]);
    }
}
