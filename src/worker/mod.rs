//! The Worker: one directory, end to end.
//!
//! Runs the state machine
//! `Locking → Scanning → Diffing → Processing → Finalizing`, streaming
//! stage transitions, per-file results, and classified errors to the
//! Master through its message sink. Per-file faults never end the run;
//! worker-scope faults release the lock and exit with a terminal state.

pub mod ipc;

use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cancel::CancelFlag;
use crate::chunking::ChunkingManager;
use crate::config::Config;
use crate::facade::{DatabaseView, VectorStore};
use crate::lock::{DirectoryLock, LockError, LockManager, LockStatus};
use crate::models::{
    DirectoryReport, ErrorKind, FileRecord, FileResult, FileStatus, ProcessingError, Stage,
    WorkerState,
};
use crate::parser::{self, Format};
use crate::retry::{ErrorHandler, RetryPolicy};
use crate::scanner::{self, ScanOptions};

use ipc::{MessageSink, WorkerMessage};

/// Process exit codes for the worker subcommand.
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_LOCK_DENIED: i32 = 1;
pub const EXIT_FAILED: i32 = 2;
pub const EXIT_CANCELLED: i32 = 3;

/// What a finished run hands back to the caller.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub report: DirectoryReport,
    pub exit_code: i32,
}

pub struct Worker<'a> {
    directory: PathBuf,
    config: &'a Config,
    facade: &'a dyn VectorStore,
    sink: &'a dyn MessageSink,
    locks: LockManager,
    cancel: CancelFlag,
}

impl<'a> Worker<'a> {
    pub fn new(
        directory: PathBuf,
        config: &'a Config,
        facade: &'a dyn VectorStore,
        sink: &'a dyn MessageSink,
        cancel: CancelFlag,
    ) -> Self {
        let locks = LockManager::new(config.lock.timeout);
        Self {
            directory,
            config,
            facade,
            sink,
            locks,
            cancel,
        }
    }

    /// Run the full state machine. Never panics out of a held lock:
    /// every terminal path releases it first.
    pub async fn run(&self) -> WorkerOutcome {
        let mut report = DirectoryReport::empty(&self.directory, WorkerState::Spawned);
        report.started_at = Utc::now();

        let (records_tx, mut records_rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy::from_config(&self.config.retry);
        let handler = ErrorHandler::new(policy.clone()).with_records(records_tx.clone());
        // Per-service retry ceilings override the global one.
        let store_handler = ErrorHandler::new(
            policy
                .clone()
                .with_attempt_override(self.config.upstream.vector_store.retries),
        )
        .with_records(records_tx.clone());
        let prepare_handler = ErrorHandler::new(
            policy.with_attempt_override(self.config.upstream.embedding.retries),
        )
        .with_records(records_tx);

        // ── Locking ──
        self.stage(WorkerState::Locking);
        let lock = match self.acquire_lock(&handler).await {
            Ok(lock) => lock,
            Err(e) => {
                self.pump_errors(&mut records_rx);
                let state = if e.kind == ErrorKind::AlreadyLocked {
                    info!(directory = %self.directory.display(), "directory owned by a live process");
                    WorkerState::LockDenied
                } else {
                    WorkerState::Failed
                };
                report.errors.push(e);
                return self.finish(report, state, None);
            }
        };

        // ── Scanning ──
        self.stage(WorkerState::Scanning);
        let options = ScanOptions::from(&self.config.watch);
        let scanned = match scanner::scan(&self.directory, &options, None) {
            Ok(outcome) => outcome,
            Err(e) => {
                let err = ProcessingError::new(
                    ErrorKind::DirectoryUnavailable,
                    Stage::Scanning,
                    e.to_string(),
                )
                .with_directory(&self.directory);
                self.sink.send(&WorkerMessage::Error { error: err.clone() });
                report.errors.push(err);
                return self.finish(report, WorkerState::Failed, Some(lock));
            }
        };
        report.files_seen = scanned.entries_seen;

        // ── Diffing ──
        self.stage(WorkerState::Diffing);
        let view = DatabaseView::new(self.facade);
        let view = &view;
        let delta = match store_handler
            .run(Stage::Diffing, |_| {
                let files = scanned.files.clone();
                async move {
                    view.diff(&self.directory, files).await.map_err(|e| {
                        ProcessingError::new(e.kind(), Stage::Diffing, e.to_string())
                            .with_directory(&self.directory)
                    })
                }
            })
            .await
        {
            Ok(delta) => delta,
            Err(e) => {
                self.pump_errors(&mut records_rx);
                report.errors.push(e);
                return self.finish(report, WorkerState::Failed, Some(lock));
            }
        };

        // ── Processing ──
        self.stage(WorkerState::Processing);
        let manager = ChunkingManager::new(self.facade, self.config.chunking.clone());

        for file in &scanned.oversize {
            self.file_decided(
                &mut report,
                FileResult {
                    path: file.path.clone(),
                    status: FileStatus::SkippedTooLarge,
                    chunks: 0,
                    error: None,
                },
            );
        }
        for file in &delta.unchanged {
            self.file_decided(
                &mut report,
                FileResult {
                    path: file.path.clone(),
                    status: FileStatus::SkippedUnchanged,
                    chunks: 0,
                    error: None,
                },
            );
        }

        let mut cancelled = false;
        let mut decided = 0u64;
        for file in &delta.to_process {
            if self.cancel.is_set() {
                cancelled = true;
                break;
            }

            let result = self
                .process_file(&manager, &prepare_handler, &store_handler, file)
                .await;
            if result
                .error
                .as_ref()
                .is_some_and(|e| e.kind == ErrorKind::Cancelled)
            {
                cancelled = true;
            }

            self.file_decided(&mut report, result);
            self.pump_errors(&mut records_rx);

            decided += 1;
            if decided % self.config.watch.progress_every == 0 {
                self.sink.send(&WorkerMessage::Progress {
                    files_seen: report.files_seen,
                    files_processed: report.files_processed,
                    files_failed: report.files_failed,
                    current: Some(file.path.clone()),
                });
            }

            if cancelled {
                break;
            }
        }

        // ── Finalizing ──
        self.stage(WorkerState::Finalizing);
        self.pump_errors(&mut records_rx);
        let state = if cancelled {
            WorkerState::Cancelled
        } else {
            WorkerState::Exited
        };
        self.finish(report, state, Some(lock))
    }

    async fn acquire_lock(&self, handler: &ErrorHandler) -> Result<DirectoryLock, ProcessingError> {
        handler
            .run(Stage::Locking, |_| async move {
                self.locks.acquire(&self.directory).map_err(|e| {
                    let kind = match &e {
                        LockError::AlreadyLocked { .. } => ErrorKind::AlreadyLocked,
                        LockError::NotOwner { .. } => ErrorKind::NotOwner,
                        LockError::DirectoryUnavailable(_) => ErrorKind::DirectoryUnavailable,
                        LockError::Io(_) => ErrorKind::LockIo,
                    };
                    ProcessingError::new(kind, Stage::Locking, e.to_string())
                        .with_directory(&self.directory)
                })
            })
            .await
    }

    /// Decide one file: parse, chunk, commit. File-scope failures are
    /// absorbed into the returned result.
    async fn process_file(
        &self,
        manager: &ChunkingManager<'_>,
        prepare_handler: &ErrorHandler,
        store_handler: &ErrorHandler,
        file: &FileRecord,
    ) -> FileResult {
        let started = std::time::Instant::now();
        let failed = |error: ProcessingError| FileResult {
            path: file.path.clone(),
            status: FileStatus::Failed,
            chunks: 0,
            error: Some(error),
        };

        let source = match parser::read_source(&file.path) {
            Ok(source) => source,
            Err(e) => {
                return failed(
                    ProcessingError::new(ErrorKind::FileIo, Stage::Parsing, e.to_string())
                        .with_file(&file.path),
                );
            }
        };

        let format = Format::from_extension(&file.extension).unwrap_or(Format::Text);
        let blocks = match parser::parser_for(format).and_then(|p| p.parse(&source)) {
            Ok(blocks) => blocks,
            Err(e) => {
                return failed(
                    ProcessingError::new(ErrorKind::Parse, Stage::Parsing, e.to_string())
                        .with_file(&file.path),
                );
            }
        };

        if blocks.is_empty() {
            return FileResult {
                path: file.path.clone(),
                status: FileStatus::SkippedEmpty,
                chunks: 0,
                error: None,
            };
        }

        // Race phase 1 against the stop flag so an in-flight upstream
        // call is dropped rather than waited out. Nothing has been
        // written yet, so no compensation is needed here.
        let prepared = tokio::select! {
            outcome = manager.prepare(file, &blocks, prepare_handler) => match outcome {
                Ok(prepared) => prepared,
                Err(e) => return failed(e),
            },
            _ = self.cancel.cancelled() => {
                return failed(
                    ProcessingError::new(
                        ErrorKind::Cancelled,
                        Stage::Embedding,
                        "stop requested during prepare",
                    )
                    .with_file(&file.path),
                );
            }
        };

        // A stop observed here aborts before anything is written.
        if self.cancel.is_set() {
            return failed(
                ProcessingError::new(
                    ErrorKind::Cancelled,
                    Stage::Committing,
                    "stop requested before commit",
                )
                .with_file(&file.path),
            );
        }

        match manager.commit(&prepared, store_handler, &self.cancel).await {
            Ok(chunks) => {
                info!(
                    file = %file.path.display(),
                    chunks,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "file indexed"
                );
                FileResult {
                    path: file.path.clone(),
                    status: FileStatus::Committed,
                    chunks,
                    error: None,
                }
            }
            Err(e) => failed(e.with_file(&file.path)),
        }
    }

    fn file_decided(&self, report: &mut DirectoryReport, result: FileResult) {
        report.record(&result);
        if let Some(error) = &result.error {
            report.errors.push(error.clone());
        }
        info!(
            file = %result.path.display(),
            status = ?result.status,
            chunks = result.chunks,
            "file decided"
        );
        self.sink.send(&WorkerMessage::FileResult { result });
    }

    /// Emit the terminal messages, release the lock if held, and map the
    /// terminal state to an exit code.
    fn finish(
        &self,
        mut report: DirectoryReport,
        state: WorkerState,
        lock: Option<DirectoryLock>,
    ) -> WorkerOutcome {
        let mut ownership_lost = false;
        if let Some(mut lock) = lock {
            let status = match state {
                WorkerState::Failed => LockStatus::Failed,
                _ => LockStatus::Completing,
            };
            if let Err(e) = self.locks.update_status(&mut lock, status) {
                warn!(error = %e, "could not update lock status before release");
            }
            if let Err(e) = self.locks.release(&lock) {
                // Releasing a lock we do not own is a programming error;
                // still emit the final message, but exit as failed.
                error!(error = %e, "lock release failed");
                ownership_lost = matches!(e, LockError::NotOwner { .. });
            }
        }

        let exit_code = if ownership_lost {
            EXIT_FAILED
        } else {
            match state {
                WorkerState::LockDenied => EXIT_LOCK_DENIED,
                WorkerState::Failed => EXIT_FAILED,
                WorkerState::Cancelled => EXIT_CANCELLED,
                _ => EXIT_CLEAN,
            }
        };

        report.state = state;
        report.finished_at = Utc::now();

        self.stage(state);
        self.sink.send(&WorkerMessage::Final {
            report: report.clone(),
        });

        WorkerOutcome { report, exit_code }
    }

    fn stage(&self, state: WorkerState) {
        self.sink.send(&WorkerMessage::Stage { state });
    }

    fn pump_errors(&self, rx: &mut mpsc::UnboundedReceiver<ProcessingError>) {
        while let Ok(error) = rx.try_recv() {
            self.sink.send(&WorkerMessage::Error { error });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;

    use crate::facade::{CommitReceipt, FacadeError, HealthReport};
    use crate::models::{Chunk, IndexedFileRecord};
    use ipc::VecSink;

    /// In-memory store tracking committed chunks per source_id.
    #[derive(Default)]
    struct MemoryStore {
        listed: Mutex<Vec<IndexedFileRecord>>,
        committed: Mutex<Vec<Chunk>>,
        fail_commits: Mutex<bool>,
    }

    #[async_trait]
    impl VectorStore for MemoryStore {
        async fn list_files(&self, _dir: &Path) -> Result<Vec<IndexedFileRecord>, FacadeError> {
            Ok(self.listed.lock().unwrap().clone())
        }

        async fn prepare_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<Chunk>, FacadeError> {
            Ok(chunks)
        }

        async fn commit_chunks(&self, chunks: &[Chunk]) -> Result<CommitReceipt, FacadeError> {
            if *self.fail_commits.lock().unwrap() {
                return Err(FacadeError::Unavailable {
                    service: "vector_store",
                    detail: "503".into(),
                });
            }
            self.committed.lock().unwrap().extend_from_slice(chunks);
            Ok(CommitReceipt {
                created: chunks.len() as u64,
                ids: Vec::new(),
            })
        }

        async fn delete_by_source(&self, source_id: &str) -> Result<u64, FacadeError> {
            let mut committed = self.committed.lock().unwrap();
            let before = committed.len();
            committed.retain(|c| c.source_id != source_id);
            Ok((before - committed.len()) as u64)
        }

        async fn health(&self) -> HealthReport {
            HealthReport::new()
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.retry.base_delay = 1;
        config.retry.max_delay = 2;
        config
    }

    #[tokio::test]
    async fn test_happy_path_markdown_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.md"),
            "# One\n\npara a\n\npara b\n\n## Two\n\npara c\n",
        )
        .unwrap();

        let config = test_config();
        let store = MemoryStore::default();
        let sink = VecSink::default();
        let worker = Worker::new(
            dir.path().to_path_buf(),
            &config,
            &store,
            &sink,
            CancelFlag::new(),
        );

        let outcome = worker.run().await;
        assert_eq!(outcome.exit_code, EXIT_CLEAN);
        assert_eq!(outcome.report.state, WorkerState::Exited);
        assert_eq!(outcome.report.files_processed, 1);
        assert_eq!(outcome.report.chunks_created, 5);

        // All chunks share one valid v4 source_id and the source path.
        let committed = store.committed.lock().unwrap();
        assert_eq!(committed.len(), 5);
        let id = &committed[0].source_id;
        assert_eq!(
            uuid::Uuid::parse_str(id).unwrap().get_version_num(),
            4
        );
        assert!(committed.iter().all(|c| &c.source_id == id));

        // Lock is gone.
        assert!(!LockManager::lock_path(dir.path()).exists());

        // Stage transitions arrived in order.
        let stages: Vec<WorkerState> = sink
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Stage { state } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            stages,
            vec![
                WorkerState::Locking,
                WorkerState::Scanning,
                WorkerState::Diffing,
                WorkerState::Processing,
                WorkerState::Finalizing,
                WorkerState::Exited,
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_directory_clean_zero_report() {
        let dir = tempfile::tempdir().unwrap();

        let config = test_config();
        let store = MemoryStore::default();
        let sink = VecSink::default();
        let worker = Worker::new(
            dir.path().to_path_buf(),
            &config,
            &store,
            &sink,
            CancelFlag::new(),
        );

        let outcome = worker.run().await;
        assert_eq!(outcome.exit_code, EXIT_CLEAN);
        assert_eq!(outcome.report.files_seen, 0);
        assert_eq!(outcome.report.files_processed, 0);
        assert!(store.committed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lock_denied_exits_one_without_touching_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockManager::new(3600);
        // This process holds the lock; our own pid is alive.
        let held = locks.acquire(dir.path()).unwrap();

        let config = test_config();
        let store = MemoryStore::default();
        let sink = VecSink::default();
        let worker = Worker::new(
            dir.path().to_path_buf(),
            &config,
            &store,
            &sink,
            CancelFlag::new(),
        );

        let outcome = worker.run().await;
        assert_eq!(outcome.exit_code, EXIT_LOCK_DENIED);
        assert_eq!(outcome.report.state, WorkerState::LockDenied);
        assert!(LockManager::lock_path(dir.path()).exists());

        locks.release(&held).unwrap();
    }

    #[tokio::test]
    async fn test_orphan_lock_reclaimed_then_processes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello world\n").unwrap();

        // Lock naming a pid that cannot exist.
        std::fs::write(
            LockManager::lock_path(dir.path()),
            serde_json::json!({
                "process_id": 99_999_999u32,
                "created_at": "2026-01-01T00:00:00Z",
                "directory": dir.path(),
                "status": "active",
                "lock_file_path": LockManager::lock_path(dir.path()),
            })
            .to_string(),
        )
        .unwrap();

        let config = test_config();
        let store = MemoryStore::default();
        let sink = VecSink::default();
        let worker = Worker::new(
            dir.path().to_path_buf(),
            &config,
            &store,
            &sink,
            CancelFlag::new(),
        );

        let outcome = worker.run().await;
        assert_eq!(outcome.exit_code, EXIT_CLEAN);
        assert_eq!(outcome.report.files_processed, 1);
        assert!(!LockManager::lock_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_commit_failure_compensates_and_continues() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "some text\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "more text\n").unwrap();

        let config = test_config();
        let store = MemoryStore::default();
        *store.fail_commits.lock().unwrap() = true;

        let sink = VecSink::default();
        let worker = Worker::new(
            dir.path().to_path_buf(),
            &config,
            &store,
            &sink,
            CancelFlag::new(),
        );

        let outcome = worker.run().await;
        // Per-file failures do not end the run.
        assert_eq!(outcome.exit_code, EXIT_CLEAN);
        assert_eq!(outcome.report.files_failed, 2);
        assert!(store.committed.lock().unwrap().is_empty());
        assert!(!LockManager::lock_path(dir.path()).exists());

        // Each file surfaced an UpstreamUnavailable failure.
        let failures: Vec<_> = outcome
            .report
            .errors
            .iter()
            .filter(|e| e.kind == ErrorKind::UpstreamUnavailable)
            .collect();
        assert!(!failures.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_files_issue_no_commits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "stable content\n").unwrap();
        let mtime: chrono::DateTime<Utc> =
            std::fs::metadata(&path).unwrap().modified().unwrap().into();

        let store = MemoryStore::default();
        store.listed.lock().unwrap().push(IndexedFileRecord {
            path: path.clone(),
            indexed_at: mtime,
            modified_at: mtime,
            chunk_count: 1,
            status: "indexed".into(),
            content_hash: None,
        });

        let config = test_config();
        let sink = VecSink::default();
        let worker = Worker::new(
            dir.path().to_path_buf(),
            &config,
            &store,
            &sink,
            CancelFlag::new(),
        );

        let outcome = worker.run().await;
        assert_eq!(outcome.exit_code, EXIT_CLEAN);
        assert_eq!(outcome.report.files_skipped, 1);
        assert_eq!(outcome.report.files_processed, 0);
        assert!(store.committed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_processing_skips_remaining() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "text a\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "text b\n").unwrap();

        let config = test_config();
        let store = MemoryStore::default();
        let sink = VecSink::default();
        let cancel = CancelFlag::new();
        cancel.set();

        let worker = Worker::new(
            dir.path().to_path_buf(),
            &config,
            &store,
            &sink,
            cancel,
        );

        let outcome = worker.run().await;
        assert_eq!(outcome.exit_code, EXIT_CANCELLED);
        assert_eq!(outcome.report.state, WorkerState::Cancelled);
        assert!(store.committed.lock().unwrap().is_empty());
        assert!(!LockManager::lock_path(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_empty_file_skipped_without_upstream_calls() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.txt"), "\n\n\n").unwrap();

        let config = test_config();
        let store = MemoryStore::default();
        let sink = VecSink::default();
        let worker = Worker::new(
            dir.path().to_path_buf(),
            &config,
            &store,
            &sink,
            CancelFlag::new(),
        );

        let outcome = worker.run().await;
        assert_eq!(outcome.exit_code, EXIT_CLEAN);
        assert_eq!(outcome.report.files_skipped, 1);
        assert!(store.committed.lock().unwrap().is_empty());

        let statuses: Vec<FileStatus> = sink
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::FileResult { result } => Some(result.status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![FileStatus::SkippedEmpty]);
    }

    #[tokio::test]
    async fn test_oversize_file_skipped_unparsed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(1024)).unwrap();

        let mut config = test_config();
        config.watch.max_file_size = 100;

        let store = MemoryStore::default();
        let sink = VecSink::default();
        let worker = Worker::new(
            dir.path().to_path_buf(),
            &config,
            &store,
            &sink,
            CancelFlag::new(),
        );

        let outcome = worker.run().await;
        assert_eq!(outcome.exit_code, EXIT_CLEAN);
        assert_eq!(outcome.report.files_skipped, 1);

        let statuses: Vec<FileStatus> = sink
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::FileResult { result } => Some(result.status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![FileStatus::SkippedTooLarge]);
    }
}
