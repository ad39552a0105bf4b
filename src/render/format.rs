use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::search::SearchOverlay;

static EMPHASIS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("emphasis pattern"));

/// Structural unit of a message, before inline formatting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Heading { level: u8, text: String },
    List { items: Vec<String> },
    Paragraph { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum Span {
    Text(String),
    Emphasis(String),
    Highlight(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RenderedBlock {
    Heading { level: u8, spans: Vec<Span> },
    List { items: Vec<Vec<Span>> },
    Paragraph { spans: Vec<Span> },
}

pub(crate) fn plain(text: &str) -> Vec<Span> {
    if text.is_empty() { Vec::new() } else { vec![Span::Text(text.to_owned())] }
}

fn heading(line: &str) -> Option<(u8, &str)> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if !(1..=3).contains(&hashes) {
        return None;
    }
    let rest = &line[hashes..];
    rest.starts_with(char::is_whitespace)
        .then(|| (hashes as u8, rest.trim_start()))
}

fn list_item(line: &str) -> Option<&str> {
    line.strip_prefix("- ").map(str::trim_start)
}

/// Splits text into headings, lists and paragraphs.
///
/// A list runs over consecutive `- ` lines and ends at a blank line or any
/// other line. A paragraph keeps its original lines and line breaks and ends
/// at a blank line or a heading/list line.
pub fn parse_blocks(text: &str) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut list: Vec<String> = Vec::new();

    let flush_paragraph = |blocks: &mut Vec<Block>, paragraph: &mut Vec<&str>| {
        if !paragraph.is_empty() {
            blocks.push(Block::Paragraph { text: paragraph.join("\n") });
            paragraph.clear();
        }
    };
    let flush_list = |blocks: &mut Vec<Block>, list: &mut Vec<String>| {
        if !list.is_empty() {
            blocks.push(Block::List { items: std::mem::take(list) });
        }
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some((level, rest)) = heading(trimmed) {
            flush_paragraph(&mut blocks, &mut paragraph);
            flush_list(&mut blocks, &mut list);
            blocks.push(Block::Heading { level, text: rest.to_owned() });
        } else if let Some(item) = list_item(trimmed) {
            flush_paragraph(&mut blocks, &mut paragraph);
            list.push(item.to_owned());
        } else if trimmed.is_empty() {
            flush_list(&mut blocks, &mut list);
            flush_paragraph(&mut blocks, &mut paragraph);
        } else {
            flush_list(&mut blocks, &mut list);
            paragraph.push(line);
        }
    }
    flush_list(&mut blocks, &mut list);
    flush_paragraph(&mut blocks, &mut paragraph);
    blocks
}

/// Recognizes `**text**` runs; unterminated markers stay literal.
pub fn emphasize(text: &str) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut last = 0;
    for caps in EMPHASIS.captures_iter(text) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else { continue };
        if whole.start() > last {
            spans.push(Span::Text(text[last..whole.start()].to_owned()));
        }
        spans.push(Span::Emphasis(inner.as_str().to_owned()));
        last = whole.end();
    }
    if last < text.len() {
        spans.push(Span::Text(text[last..].to_owned()));
    }
    spans
}

/// Parses `text` and applies inline formatting.
///
/// With a non-blank `query` every block is rendered with search highlights
/// and emphasis is not applied; otherwise paragraphs and list items get
/// emphasis and headings stay plain.
pub fn format_blocks(text: &str, query: Option<&str>) -> Vec<RenderedBlock> {
    let overlay = query.and_then(SearchOverlay::new);
    let inline = |s: &str| match &overlay {
        Some(o) => o.highlight(s),
        None => emphasize(s),
    };
    parse_blocks(text)
        .into_iter()
        .map(|block| match block {
            Block::Heading { level, text } => RenderedBlock::Heading {
                level,
                spans: match &overlay {
                    Some(o) => o.highlight(&text),
                    None => plain(&text),
                },
            },
            Block::List { items } => RenderedBlock::List {
                items: items.iter().map(|i| inline(i.as_str())).collect(),
            },
            Block::Paragraph { text } => RenderedBlock::Paragraph { spans: inline(text.as_str()) },
        })
        .collect()
}
