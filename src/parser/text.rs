//! Plain text parser: paragraphs separated by blank lines.

use serde_json::Map;

use super::{FileParser, Format, ParserError};
use crate::models::{Block, BlockKind};

/// Splits on blank-line separators. Trailing whitespace inside a
/// paragraph is normalized away; byte offsets always refer to the
/// original source.
pub struct TextParser;

impl TextParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TextParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FileParser for TextParser {
    fn parse(&self, source: &str) -> Result<Vec<Block>, ParserError> {
        let mut blocks = Vec::new();

        // Current paragraph accumulator.
        let mut lines: Vec<&str> = Vec::new();
        let mut start_byte = 0usize;
        let mut end_byte = 0usize;
        let mut start_line = 0u32;
        let mut end_line = 0u32;

        let mut offset = 0usize;
        for (idx, raw) in source.split_inclusive('\n').enumerate() {
            let line_no = idx as u32 + 1;
            let line = raw.strip_suffix('\n').unwrap_or(raw);
            let line = line.strip_suffix('\r').unwrap_or(line);

            if line.trim().is_empty() {
                flush(&mut blocks, &mut lines, start_byte, end_byte, start_line, end_line);
            } else {
                if lines.is_empty() {
                    start_byte = offset;
                    start_line = line_no;
                }
                end_byte = offset + line.len();
                end_line = line_no;
                lines.push(line);
            }

            offset += raw.len();
        }
        flush(&mut blocks, &mut lines, start_byte, end_byte, start_line, end_line);

        Ok(blocks)
    }

    fn format(&self) -> Format {
        Format::Text
    }
}

fn flush(
    blocks: &mut Vec<Block>,
    lines: &mut Vec<&str>,
    start_byte: usize,
    end_byte: usize,
    start_line: u32,
    end_line: u32,
) {
    if lines.is_empty() {
        return;
    }

    let body = lines
        .iter()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    lines.clear();

    if body.is_empty() {
        return;
    }

    blocks.push(Block {
        body,
        kind: BlockKind::Paragraph,
        start_byte,
        end_byte,
        start_line,
        end_line,
        ordinal: blocks.len() as u32,
        title: None,
        attributes: Map::new(),
    });
}
