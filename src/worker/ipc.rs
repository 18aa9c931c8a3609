//! Master ↔ Worker messaging.
//!
//! The Worker's stdout carries newline-delimited JSON, one
//! [`WorkerMessage`] per line; logs go to stderr so the stream stays
//! clean. The Worker's stdin carries control lines from the Master
//! (currently just `stop`). Unparseable lines are dropped by the reader,
//! never fatal.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DirectoryReport, FileResult, ProcessingError, WorkerState};

/// One line on the Worker's stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// State-machine transition.
    Stage { state: WorkerState },

    /// Periodic processing progress.
    Progress {
        files_seen: u64,
        files_processed: u64,
        files_failed: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current: Option<PathBuf>,
    },

    /// Liveness signal on the configured cadence.
    Heartbeat { at: DateTime<Utc> },

    /// One decided file.
    FileResult { result: FileResult },

    /// One classified failure (one per retry attempt).
    Error { error: ProcessingError },

    /// Terminal summary, emitted exactly once before exit.
    Final { report: DirectoryReport },
}

impl WorkerMessage {
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

/// Control line on the Worker's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    Stop,
}

impl ControlMessage {
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "stop" => Some(ControlMessage::Stop),
            _ => None,
        }
    }

    pub fn as_line(self) -> &'static str {
        match self {
            ControlMessage::Stop => "stop\n",
        }
    }
}

/// Where a Worker sends its messages. A trait so pipeline tests can
/// capture the stream in memory.
pub trait MessageSink: Send + Sync {
    fn send(&self, message: &WorkerMessage);
}

/// Production sink: one JSON line per message on stdout, flushed
/// immediately so the Master sees heartbeats on time even through a pipe.
pub struct StdoutSink;

impl MessageSink for StdoutSink {
    fn send(&self, message: &WorkerMessage) {
        let Ok(line) = serde_json::to_string(message) else {
            return;
        };
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

/// Capturing sink for tests.
#[derive(Default)]
pub struct VecSink {
    pub messages: std::sync::Mutex<Vec<WorkerMessage>>,
}

impl MessageSink for VecSink {
    fn send(&self, message: &WorkerMessage) {
        self.messages.lock().unwrap().push(message.clone());
    }
}
