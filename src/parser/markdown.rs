//! Markdown parser producing one block per structural element.
//!
//! Uses tree-sitter with the Markdown grammar. Recognized elements:
//! ATX and setext headings, paragraphs, fenced and indented code blocks,
//! list items, block quotes, and horizontal rules. Bodies keep the
//! element source verbatim; inline formatting is not expanded.

use serde_json::{Map, Value};
use tree_sitter::{Node, Parser};

use super::{FileParser, Format, ParserError};
use crate::models::{Block, BlockKind};

pub struct MarkdownParser {
    _marker: (),
}

impl MarkdownParser {
    pub fn new() -> Result<Self, ParserError> {
        Ok(Self { _marker: () })
    }

    fn create_parser() -> Result<Parser, ParserError> {
        let mut parser = Parser::new();
        let language = tree_sitter_md::LANGUAGE;
        parser
            .set_language(&language.into())
            .map_err(|e| ParserError::Grammar(e.to_string()))?;
        Ok(parser)
    }

    fn collect(&self, node: Node, source: &str, blocks: &mut Vec<Block>) {
        let kind = match node.kind() {
            "atx_heading" | "setext_heading" => Some(BlockKind::Heading),
            "paragraph" => Some(BlockKind::Paragraph),
            "fenced_code_block" | "indented_code_block" => Some(BlockKind::CodeBlock),
            "list_item" => Some(BlockKind::ListItem),
            "block_quote" => Some(BlockKind::BlockQuote),
            "thematic_break" => Some(BlockKind::HorizontalRule),
            _ => None,
        };

        if let Some(kind) = kind {
            if let Some(block) = self.make_block(node, source, kind, blocks.len() as u32) {
                blocks.push(block);
            }
            // A mapped element is one block; its children are part of it.
            return;
        }

        // Containers (document, section, list) and anything unrecognized.
        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            self.collect(child, source, blocks);
        }
    }

    fn make_block(
        &self,
        node: Node,
        source: &str,
        kind: BlockKind,
        ordinal: u32,
    ) -> Option<Block> {
        let raw = node.utf8_text(source.as_bytes()).ok()?;
        let body = raw.trim_end().to_string();
        if body.is_empty() {
            return None;
        }

        let start_line = node.start_position().row as u32 + 1;
        let mut end_line = node.end_position().row as u32 + 1;
        // Nodes ending exactly at a line start span up to the previous line.
        if node.end_position().column == 0 && end_line > start_line {
            end_line -= 1;
        }

        let mut title = None;
        let mut attributes = Map::new();

        match kind {
            BlockKind::Heading => {
                let (level, text) = heading_info(&body);
                attributes.insert("level".to_string(), Value::from(level));
                if !text.is_empty() {
                    title = Some(text);
                }
            }
            BlockKind::CodeBlock => {
                if let Some(language) = code_language(node, source) {
                    attributes.insert("language".to_string(), Value::from(language));
                }
            }
            _ => {}
        }

        Some(Block {
            body,
            kind,
            start_byte: node.start_byte(),
            end_byte: node.end_byte(),
            start_line,
            end_line,
            ordinal,
            title,
            attributes,
        })
    }
}

impl FileParser for MarkdownParser {
    fn parse(&self, source: &str) -> Result<Vec<Block>, ParserError> {
        let mut parser = Self::create_parser()?;
        let tree = parser
            .parse(source, None)
            .ok_or_else(|| ParserError::Parse("tree-sitter returned no tree".into()))?;

        let mut blocks = Vec::new();
        self.collect(tree.root_node(), source, &mut blocks);
        Ok(blocks)
    }

    fn format(&self) -> Format {
        Format::Markdown
    }
}

/// Heading level and cleaned title text, for both ATX and setext forms.
fn heading_info(body: &str) -> (u32, String) {
    let first = body.lines().next().unwrap_or("");
    if first.trim_start().starts_with('#') {
        let trimmed = first.trim_start();
        let level = trimmed.chars().take_while(|&c| c == '#').count().min(6) as u32;
        let title = trimmed
            .trim_start_matches('#')
            .trim()
            .trim_end_matches('#')
            .trim()
            .to_string();
        (level, title)
    } else {
        let level = match body
            .lines()
            .nth(1)
            .and_then(|l| l.trim_start().chars().next())
        {
            Some('=') => 1,
            _ => 2,
        };
        (level, first.trim().to_string())
    }
}

/// Fence info string (e.g. "rust") of a fenced code block, if present.
fn code_language(node: Node, source: &str) -> Option<String> {
    let mut cursor = node.walk();
    let info = node
        .children(&mut cursor)
        .find(|c| c.kind() == "info_string" || c.kind() == "language")?;
    let text = info.utf8_text(source.as_bytes()).ok()?.trim();
    (!text.is_empty()).then(|| text.to_string())
}
