//! The single abstraction over the three upstream services.
//!
//! Everything remote (segmentation, embedding, chunk persistence) is
//! reached through the [`VectorStore`] capability. The rest of the core
//! never holds an HTTP client, which keeps the service graph acyclic and
//! lets tests substitute an in-memory fake with scripted failures.

mod dbview;
mod http;

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{Chunk, ErrorKind, IndexedFileRecord};

pub use dbview::{DatabaseView, Delta};
pub use http::HttpFacade;

#[derive(Debug, Error)]
pub enum FacadeError {
    /// Network fault or 5xx; the call may be retried.
    #[error("upstream unavailable ({service}): {detail}")]
    Unavailable { service: &'static str, detail: String },

    /// The reply could not be interpreted as the expected shape.
    #[error("upstream protocol error ({service}): {detail}")]
    Protocol { service: &'static str, detail: String },

    /// Upstream 4xx or local validation failure. Permanent.
    #[error("rejected by {service}: {detail}")]
    Rejected { service: &'static str, detail: String },

    /// A commit batch reported fewer creations than submitted chunks.
    #[error("partial commit: {created} of {submitted} chunks accepted")]
    PartialFailure { created: u64, submitted: u64 },

    /// Unknown `source_id` on delete.
    #[error("source {0} not found")]
    NotFound(String),
}

impl FacadeError {
    /// Taxonomy kind for the Error Handler.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FacadeError::Unavailable { .. } => ErrorKind::UpstreamUnavailable,
            FacadeError::Protocol { .. } => ErrorKind::UpstreamProtocol,
            FacadeError::Rejected { .. } => ErrorKind::Rejected,
            FacadeError::PartialFailure { .. } => ErrorKind::PartialFailure,
            FacadeError::NotFound(_) => ErrorKind::Rejected,
        }
    }
}

/// Result of a successful commit batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub created: u64,
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Health of one upstream service, reported inline; `health()` itself
/// never fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub type HealthReport = BTreeMap<String, ServiceHealth>;

/// The remote capability consumed by the pipeline.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Files the store already knows under `dir`. Used for diffing only.
    async fn list_files(&self, dir: &Path) -> Result<Vec<IndexedFileRecord>, FacadeError>;

    /// Run provisional chunks through segmentation and embedding.
    /// The result may contain additional derived chunks; relative order
    /// of the input is preserved.
    async fn prepare_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<Chunk>, FacadeError>;

    /// Persist one batch of finalized chunks.
    async fn commit_chunks(&self, chunks: &[Chunk]) -> Result<CommitReceipt, FacadeError>;

    /// Remove every chunk carrying `source_id`. Idempotent: an unknown
    /// id deletes zero chunks and succeeds.
    async fn delete_by_source(&self, source_id: &str) -> Result<u64, FacadeError>;

    /// Per-service health map. Never fails; errors are reported inline.
    async fn health(&self) -> HealthReport;
}
