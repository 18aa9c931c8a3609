//! Read model over the vector store used for diffing.
//!
//! Answers one question: which scanned files does the store not yet hold
//! in their current form? Purely a read over the facade; nothing here
//! mutates the store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::models::{FileRecord, IndexedFileRecord};

use super::{FacadeError, VectorStore};

/// Outcome of diffing a scan result against the store.
#[derive(Debug)]
pub struct Delta {
    /// Files that need (re)indexing, in scan order. Content hashes are
    /// attached where they were computed during the diff.
    pub to_process: Vec<FileRecord>,
    /// Files the store already holds unchanged.
    pub unchanged: Vec<FileRecord>,
}

/// Pure read view over [`VectorStore::list_files`].
pub struct DatabaseView<'a> {
    facade: &'a dyn VectorStore,
}

impl<'a> DatabaseView<'a> {
    pub fn new(facade: &'a dyn VectorStore) -> Self {
        Self { facade }
    }

    /// Index the store's records for `dir` by path.
    pub async fn indexed_files(
        &self,
        dir: &Path,
    ) -> Result<HashMap<PathBuf, IndexedFileRecord>, FacadeError> {
        let records = self.facade.list_files(dir).await?;
        Ok(records.into_iter().map(|r| (r.path.clone(), r)).collect())
    }

    /// Decide, per scanned file, whether it must be (re)indexed.
    ///
    /// A file is selected when it is missing from the store, when its
    /// mtime is strictly newer than the indexed mtime, or when both sides
    /// carry a content hash and the hashes differ. The hash is computed
    /// opportunistically: only when the store has one and mtime alone
    /// would skip the file.
    pub async fn diff(&self, dir: &Path, scanned: Vec<FileRecord>) -> Result<Delta, FacadeError> {
        let indexed = self.indexed_files(dir).await?;

        let mut delta = Delta {
            to_process: Vec::new(),
            unchanged: Vec::new(),
        };

        for record in scanned {
            match indexed.get(&record.path) {
                None => {
                    debug!(file = %record.path.display(), "not indexed yet");
                    delta.to_process.push(record);
                }
                Some(existing) => {
                    if record.modified_at > existing.modified_at {
                        debug!(file = %record.path.display(), "mtime newer than index");
                        delta.to_process.push(record);
                    } else if let Some(indexed_hash) = existing.content_hash.as_deref() {
                        match record.clone().with_hash() {
                            Ok(hashed) => {
                                if hashed.content_hash.as_deref() == Some(indexed_hash) {
                                    delta.unchanged.push(hashed);
                                } else {
                                    debug!(
                                        file = %hashed.path.display(),
                                        "content hash differs from index"
                                    );
                                    delta.to_process.push(hashed);
                                }
                            }
                            Err(e) => {
                                // Cannot verify; fall back to the mtime verdict.
                                warn!(error = %e, "hashing failed, trusting mtime");
                                delta.unchanged.push(record);
                            }
                        }
                    } else {
                        delta.unchanged.push(record);
                    }
                }
            }
        }

        Ok(delta)
    }
}
