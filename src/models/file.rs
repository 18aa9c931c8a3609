//! File identities on both sides of the diff.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A file on disk the pipeline may process.
///
/// Created by the Scanner, moved through the pipeline, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Absolute path.
    pub path: PathBuf,

    /// Size in bytes at scan time.
    pub size: u64,

    /// Last-modified time at scan time.
    pub modified_at: DateTime<Utc>,

    /// Lowercased extension without the dot (`txt`, `md`).
    pub extension: String,

    /// SHA-256 of the content, hex-encoded. Computed opportunistically
    /// during diffing; absent until then.
    pub content_hash: Option<String>,
}

impl FileRecord {
    /// Compute and attach the content hash, reading the file once.
    pub fn with_hash(mut self) -> std::io::Result<Self> {
        use sha2::{Digest, Sha256};
        let bytes = std::fs::read(&self.path)?;
        self.content_hash = Some(hex::encode(Sha256::digest(&bytes)));
        Ok(self)
    }
}

/// What the vector store already knows about a file.
///
/// Materialized on demand by the Database View; updated only indirectly
/// through facade writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedFileRecord {
    pub path: PathBuf,

    /// When the file was last committed.
    pub indexed_at: DateTime<Utc>,

    /// The file's mtime as observed at index time.
    pub modified_at: DateTime<Utc>,

    /// How many chunks the store holds for this file.
    pub chunk_count: u64,

    pub status: String,

    /// Content hash recorded at index time, if the store has one.
    #[serde(default)]
    pub content_hash: Option<String>,
}

/// Terminal status of one file within a directory run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Committed,
    #[serde(rename = "Skipped-Empty")]
    SkippedEmpty,
    #[serde(rename = "Skipped-TooLarge")]
    SkippedTooLarge,
    #[serde(rename = "Skipped-Unchanged")]
    SkippedUnchanged,
    Failed,
}

impl FileStatus {
    pub fn is_skip(self) -> bool {
        matches!(
            self,
            FileStatus::SkippedEmpty | FileStatus::SkippedTooLarge | FileStatus::SkippedUnchanged
        )
    }
}
