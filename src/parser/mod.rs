//! File parsing into ordered content blocks.
//!
//! Two formats are supported: plain text (blank-line paragraphs) and
//! Markdown (structural elements via tree-sitter). A parser is a narrow
//! capability selected by extension; both produce [`Block`] sequences
//! that satisfy the same invariants: non-empty bodies, ordered offsets
//! and lines, ordinals strictly increasing from zero.

mod markdown;
mod text;

use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::models::Block;

pub use markdown::MarkdownParser;
pub use text::TextParser;

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("parse failed: {0}")]
    Parse(String),

    #[error("grammar error: {0}")]
    Grammar(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supported source formats, selected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Markdown,
}

impl Format {
    /// Match a normalized (lowercase, dotless) extension.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "txt" | "text" => Some(Format::Text),
            "md" | "markdown" => Some(Format::Markdown),
            _ => None,
        }
    }
}

/// A parser turns source text into an ordered block sequence.
pub trait FileParser: Send + Sync {
    fn parse(&self, source: &str) -> Result<Vec<Block>, ParserError>;

    fn format(&self) -> Format;
}

/// Parser for the given format.
pub fn parser_for(format: Format) -> Result<Box<dyn FileParser>, ParserError> {
    match format {
        Format::Text => Ok(Box::new(TextParser::new())),
        Format::Markdown => Ok(Box::new(MarkdownParser::new()?)),
    }
}

/// Read a source file, falling back to lossy decoding on invalid UTF-8.
pub fn read_source(path: &Path) -> Result<String, ParserError> {
    let bytes = std::fs::read(path)?;
    match String::from_utf8(bytes) {
        Ok(s) => Ok(s),
        Err(e) => {
            warn!(file = %path.display(), "invalid UTF-8, decoding lossily");
            Ok(String::from_utf8_lossy(e.as_bytes()).into_owned())
        }
    }
}

/// Debug-time check of the parser output invariants.
#[cfg(test)]
pub(crate) fn assert_invariants(blocks: &[Block]) {
    for (i, block) in blocks.iter().enumerate() {
        assert!(block.is_well_formed(), "malformed block {i}: {block:?}");
        assert_eq!(block.ordinal, i as u32, "ordinal gap at {i}");
    }
}
