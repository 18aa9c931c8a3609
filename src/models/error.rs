//! The failure taxonomy and the structured records built from it.
//!
//! Every fault in the system is classified into one [`ErrorKind`]; the
//! kind alone decides scope and retry policy. [`ProcessingError`] is the
//! record that crosses module and process boundaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Classified failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad configuration at startup. Fatal for the Master.
    ConfigInvalid,
    /// Transient I/O while touching a lock file.
    #[serde(rename = "LockIOError")]
    LockIo,
    /// A live owner already holds the directory lock.
    AlreadyLocked,
    /// Release attempted by a process that does not own the lock.
    NotOwner,
    /// The scan root cannot be opened.
    DirectoryUnavailable,
    /// Per-file I/O fault.
    #[serde(rename = "FileIOError")]
    FileIo,
    /// A parser gave up on one file.
    #[serde(rename = "ParseError")]
    Parse,
    /// Network failure or 5xx from an upstream service.
    UpstreamUnavailable,
    /// Upstream replied with something we cannot interpret.
    #[serde(rename = "UpstreamProtocolError")]
    UpstreamProtocol,
    /// Upstream 4xx or local validation failure.
    Rejected,
    /// A commit batch partially succeeded.
    PartialFailure,
    /// A worker went silent past the heartbeat timeout.
    HeartbeatTimeout,
    /// Cooperative cancellation.
    Cancelled,
}

impl ErrorKind {
    /// Whether the retry loop may attempt this kind again.
    ///
    /// `UpstreamProtocol` is special-cased by the handler (retried once);
    /// everything else is either freely retryable or permanent.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::LockIo | ErrorKind::UpstreamUnavailable | ErrorKind::UpstreamProtocol
        )
    }

    /// Whether a failure of this kind is confined to a single file.
    pub fn is_file_scoped(self) -> bool {
        matches!(
            self,
            ErrorKind::FileIo | ErrorKind::Parse | ErrorKind::Rejected | ErrorKind::PartialFailure
        )
    }

    /// Stable wire name, identical to the serde encoding.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::LockIo => "LockIOError",
            ErrorKind::AlreadyLocked => "AlreadyLocked",
            ErrorKind::NotOwner => "NotOwner",
            ErrorKind::DirectoryUnavailable => "DirectoryUnavailable",
            ErrorKind::FileIo => "FileIOError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::UpstreamUnavailable => "UpstreamUnavailable",
            ErrorKind::UpstreamProtocol => "UpstreamProtocolError",
            ErrorKind::Rejected => "Rejected",
            ErrorKind::PartialFailure => "PartialFailure",
            ErrorKind::HeartbeatTimeout => "HeartbeatTimeout",
            ErrorKind::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage a failure originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Locking,
    Scanning,
    Diffing,
    Parsing,
    Chunking,
    Embedding,
    Committing,
    Compensating,
    Finalizing,
}

/// One classified failure, created at the failure site.
///
/// Retries produce one record per attempt, `attempt` counting from 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub retryable: bool,

    /// Delay the handler recommends before the next attempt, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    pub attempt: u32,

    /// Human-readable cause summary.
    pub cause: String,

    pub at: DateTime<Utc>,
}

impl ProcessingError {
    pub fn new(kind: ErrorKind, stage: Stage, cause: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            retryable: kind.is_retryable(),
            backoff_ms: None,
            directory: None,
            file: None,
            attempt: 1,
            cause: cause.into(),
            at: Utc::now(),
        }
    }

    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_backoff(mut self, delay: Duration) -> Self {
        self.backoff_ms = Some(delay.as_millis() as u64);
        self
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} at {:?} (attempt {}): {}",
            self.kind, self.stage, self.attempt, self.cause
        )
    }
}

impl std::error::Error for ProcessingError {}
