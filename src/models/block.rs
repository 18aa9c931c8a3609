//! Content blocks produced by the parsers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structural kind of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading,
    ListItem,
    CodeBlock,
    BlockQuote,
    HorizontalRule,
}

/// A contiguous region of a source file.
///
/// Produced by a parser, consumed by the Chunking Manager, discarded once
/// the file's chunks are committed. Ordinals are assigned by the parser
/// and are strictly increasing from zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    /// Text content. Never empty.
    pub body: String,

    pub kind: BlockKind,

    /// Byte offsets into the source file, `start <= end`.
    pub start_byte: usize,
    pub end_byte: usize,

    /// 1-indexed line numbers, `start_line <= end_line`.
    pub start_line: u32,
    pub end_line: u32,

    /// Position within the file's block sequence, starting at zero.
    pub ordinal: u32,

    /// Heading text or similar label, when the element has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Free-form attributes (heading level, code fence language, ...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub attributes: serde_json::Map<String, Value>,
}

impl Block {
    /// Check the parser invariants: non-empty body, ordered offsets and lines.
    pub fn is_well_formed(&self) -> bool {
        !self.body.is_empty()
            && self.start_byte <= self.end_byte
            && self.start_line <= self.end_line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(body: &str) -> Block {
        Block {
            body: body.to_string(),
            kind: BlockKind::Paragraph,
            start_byte: 0,
            end_byte: body.len(),
            start_line: 1,
            end_line: 1,
            ordinal: 0,
            title: None,
            attributes: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_well_formed() {
        assert!(block("text").is_well_formed());
        assert!(!block("").is_well_formed());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let s = serde_json::to_string(&BlockKind::CodeBlock).unwrap();
        assert_eq!(s, "\"code_block\"");
    }
}
