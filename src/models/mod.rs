//! Core data model shared across the pipeline.
//!
//! Everything the Scanner, Parsers, Chunking Manager, Worker, and Master
//! exchange lives here: file identities, content blocks, finalized chunks,
//! the error taxonomy, and per-directory reports.

mod block;
mod chunk;
mod error;
mod file;
mod report;

pub use block::{Block, BlockKind};
pub use chunk::{Chunk, ChunkStatus};
pub use error::{ErrorKind, ProcessingError, Stage};
pub use file::{FileRecord, FileStatus, IndexedFileRecord};
pub use report::{DirectoryReport, FileResult, WorkerState};
