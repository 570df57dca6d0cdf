//! Token-aware splitting of caller documents into evidence candidates.
//!
//! Documents arrive in the run context as `{source, text}` pairs. Before the
//! retriever pass sees them they are cut into chunks that respect paragraph
//! and sentence boundaries, so each snippet handed to a model is small enough
//! to cite and still reads as prose.
//!
//! Splitting order:
//! 1. paragraphs (`\n\s*\n+`)
//! 2. sentences, for paragraphs over `max_tokens`
//! 3. raw token windows, for single sentences over `max_tokens`
//!
//! Units are then packed greedily up to `max_tokens`, with `overlap_tokens`
//! of trailing context carried into the next chunk.

use fancy_regex::Regex as FancyRegex;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::gateway::Message;

static PARAGRAPH_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n\s*\n+").expect("Invalid paragraph split regex"));

// Lookbehind needs fancy-regex.
static SENTENCE_SPLIT: Lazy<FancyRegex> =
    Lazy::new(|| FancyRegex::new(r"(?<=[.!?])\s+").expect("Invalid sentence split regex"));

static TOKENIZER: Lazy<Option<CoreBPE>> = Lazy::new(|| match cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(err) => {
        tracing::warn!(error = %err, "cl100k tokenizer unavailable, estimating tokens from length");
        None
    }
});

/// Per-message framing overhead in chat formats (role markers, separators).
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum ChunkingError {
    #[error("invalid chunking parameters: {0}")]
    InvalidParams(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingParams {
    pub target_tokens: usize,
    pub min_tokens: usize,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkingParams {
    /// Evidence snippets: short enough to quote, long enough to carry a claim.
    fn default() -> Self {
        Self {
            target_tokens: 200,
            min_tokens: 120,
            max_tokens: 320,
            overlap_tokens: 40,
        }
    }
}

impl ChunkingParams {
    pub fn new(
        target_tokens: usize,
        min_tokens: usize,
        max_tokens: usize,
        overlap_tokens: usize,
    ) -> Result<Self, ChunkingError> {
        if target_tokens == 0 || max_tokens == 0 {
            return Err(ChunkingError::InvalidParams(
                "target_tokens and max_tokens must be positive".into(),
            ));
        }
        if min_tokens > target_tokens {
            return Err(ChunkingError::InvalidParams(
                "min_tokens cannot exceed target_tokens".into(),
            ));
        }
        if target_tokens > max_tokens {
            return Err(ChunkingError::InvalidParams(
                "target_tokens cannot exceed max_tokens".into(),
            ));
        }
        Ok(Self {
            target_tokens,
            min_tokens,
            max_tokens,
            // More than half a chunk of overlap makes packing crawl.
            overlap_tokens: overlap_tokens.min(target_tokens / 2),
        })
    }
}

/// A caller-supplied document from `context.documents[]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub source: String,
    pub text: String,
}

/// One chunk of a source document, with byte offsets into the original text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub source: String,
    pub text: String,
    pub tokens: usize,
    pub char_start: usize,
    pub char_end: usize,
}

#[derive(Debug, Clone)]
struct TextUnit {
    text: String,
    tokens: usize,
    start: usize,
    end: usize,
}

/// Count tokens with cl100k_base, or a 4-bytes-per-token estimate if the
/// tokenizer failed to load.
pub fn count_tokens(text: &str) -> usize {
    match TOKENIZER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.len().div_ceil(4),
    }
}

/// Prompt size estimate used for budget projection.
pub fn estimate_message_tokens(messages: &[Message]) -> u32 {
    let total: usize = messages
        .iter()
        .map(|m| count_tokens(&m.content) + MESSAGE_OVERHEAD_TOKENS)
        .sum();
    u32::try_from(total).unwrap_or(u32::MAX)
}

/// Chunk every document, preserving document order, and stop at `max_chunks`.
pub fn chunk_documents(
    documents: &[SourceDocument],
    params: &ChunkingParams,
    max_chunks: usize,
) -> Vec<DocumentChunk> {
    let mut out = Vec::new();
    for doc in documents {
        for chunk in chunk_text(&doc.text, params) {
            if out.len() >= max_chunks {
                return out;
            }
            out.push(DocumentChunk {
                source: doc.source.clone(),
                text: chunk.text,
                tokens: chunk.tokens,
                char_start: chunk.start,
                char_end: chunk.end,
            });
        }
    }
    out
}

fn chunk_text(text: &str, params: &ChunkingParams) -> Vec<TextUnit> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let total = count_tokens(text);
    if total <= params.target_tokens {
        let start = text.find(trimmed).unwrap_or(0);
        return vec![TextUnit {
            text: trimmed.to_string(),
            tokens: total,
            start,
            end: start + trimmed.len(),
        }];
    }

    let units = to_units(text, params.max_tokens);
    let groups = pack_units(&units, params);

    groups
        .into_iter()
        .filter_map(|(from, to)| {
            let slice = &units[from..to];
            let first = slice.first()?;
            let last = slice.last()?;
            Some(TextUnit {
                text: slice
                    .iter()
                    .map(|u| u.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n\n"),
                tokens: slice.iter().map(|u| u.tokens).sum(),
                start: first.start,
                end: last.end,
            })
        })
        .collect()
}

/// Greedy packing with overlap. Returns half-open unit index ranges.
fn pack_units(units: &[TextUnit], params: &ChunkingParams) -> Vec<(usize, usize)> {
    let n = units.len();
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;

    while start < n {
        let mut tokens = 0;
        let mut end = start;
        while end < n && tokens + units[end].tokens <= params.max_tokens {
            tokens += units[end].tokens;
            end += 1;
        }
        if end == start {
            end += 1;
        }
        ranges.push((start, end));
        if end >= n {
            break;
        }

        let mut carried = 0;
        let mut next = end;
        while next > start + 1 && carried < params.overlap_tokens {
            next -= 1;
            carried += units[next].tokens;
        }
        start = next.max(start + 1);
    }

    // Fold a runt tail into its predecessor when it fits.
    if ranges.len() >= 2 {
        let (tail_from, tail_to) = ranges[ranges.len() - 1];
        let tail_tokens: usize = units[tail_from..tail_to].iter().map(|u| u.tokens).sum();
        let (prev_from, _) = ranges[ranges.len() - 2];
        let merged: usize = units[prev_from..tail_to].iter().map(|u| u.tokens).sum();
        if tail_tokens < params.min_tokens && merged <= params.max_tokens {
            ranges.pop();
            if let Some(prev) = ranges.last_mut() {
                prev.1 = tail_to;
            }
        }
    }

    ranges
}

fn split_into_paragraphs(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut last = 0;
    for m in PARAGRAPH_SPLIT.find_iter(text) {
        push_trimmed(&mut out, text, last, m.start());
        last = m.end();
    }
    push_trimmed(&mut out, text, last, text.len());
    out
}

fn split_into_sentences(text: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut last = 0;
    for m in SENTENCE_SPLIT.find_iter(text).flatten() {
        push_trimmed(&mut out, text, last, m.start());
        last = m.end();
    }
    push_trimmed(&mut out, text, last, text.len());
    out
}

fn push_trimmed<'a>(out: &mut Vec<(usize, &'a str)>, text: &'a str, from: usize, to: usize) {
    let span = &text[from..to];
    let trimmed = span.trim();
    if !trimmed.is_empty() {
        let lead = span.len() - span.trim_start().len();
        out.push((from + lead, trimmed));
    }
}

fn to_units(text: &str, max_tokens: usize) -> Vec<TextUnit> {
    let mut units = Vec::new();
    for (para_start, para) in split_into_paragraphs(text) {
        let tokens = count_tokens(para);
        if tokens <= max_tokens {
            units.push(unit(para, tokens, para_start));
            continue;
        }
        for (rel, sentence) in split_into_sentences(para) {
            let abs = para_start + rel;
            let tokens = count_tokens(sentence);
            if tokens <= max_tokens {
                units.push(unit(sentence, tokens, abs));
            } else {
                units.extend(window_text(sentence, max_tokens, abs));
            }
        }
    }
    units
}

fn unit(text: &str, tokens: usize, start: usize) -> TextUnit {
    TextUnit {
        text: text.to_string(),
        tokens,
        start,
        end: start + text.len(),
    }
}

/// Last resort for a single oversized sentence: cut on char boundaries at a
/// size that stays under `max_tokens`.
fn window_text(text: &str, max_tokens: usize, base: usize) -> Vec<TextUnit> {
    let mut out = Vec::new();
    let mut from = 0;
    while from < text.len() {
        let mut to = text.len();
        loop {
            let tokens = count_tokens(&text[from..to]);
            let mut mid = from + (to - from) / 2;
            while mid < to && !text.is_char_boundary(mid) {
                mid += 1;
            }
            if tokens <= max_tokens || mid <= from || mid >= to {
                out.push(unit(&text[from..to], tokens, base + from));
                break;
            }
            to = mid;
        }
        from = to;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_tokens() {
        let count = count_tokens("Hello, world!");
        assert!(count > 0);
        assert!(count < 10);
    }

    #[test]
    fn test_params_validation() {
        assert!(ChunkingParams::new(0, 0, 10, 0).is_err());
        assert!(ChunkingParams::new(100, 150, 200, 0).is_err());
        assert!(ChunkingParams::new(300, 100, 200, 0).is_err());
        let p = ChunkingParams::new(100, 50, 200, 90).unwrap();
        assert_eq!(p.overlap_tokens, 50);
    }

    #[test]
    fn test_short_document_single_chunk() {
        let docs = vec![SourceDocument {
            source: "notes.md".into(),
            text: "  Rust ownership prevents data races.  ".into(),
        }];
        let chunks = chunk_documents(&docs, &ChunkingParams::default(), 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source, "notes.md");
        assert_eq!(chunks[0].text, "Rust ownership prevents data races.");
        assert_eq!(chunks[0].char_start, 2);
        assert_eq!(
            &docs[0].text[chunks[0].char_start..chunks[0].char_end],
            chunks[0].text
        );
    }

    #[test]
    fn test_empty_documents_are_skipped() {
        let docs = vec![SourceDocument {
            source: "empty".into(),
            text: "\n\n   ".into(),
        }];
        assert!(chunk_documents(&docs, &ChunkingParams::default(), 10).is_empty());
    }

    #[test]
    fn test_paragraph_and_sentence_splitting() {
        let paras = split_into_paragraphs("First.\n\n  Second one.\n\n\nThird.");
        let texts: Vec<&str> = paras.iter().map(|(_, t)| *t).collect();
        assert_eq!(texts, vec!["First.", "Second one.", "Third."]);

        let sentences = split_into_sentences("One. Two! Three? Four.");
        assert_eq!(sentences.len(), 4);
        assert_eq!(sentences[1], (5, "Two!"));
    }

    #[test]
    fn test_long_document_respects_limits() {
        let para = "The cache key covers the lane and the prompt. ".repeat(40);
        let text = format!("{para}\n\n{para}\n\n{para}");
        let params = ChunkingParams::default();
        let chunks = chunk_documents(
            &[SourceDocument {
                source: "long".into(),
                text,
            }],
            &params,
            100,
        );

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.tokens <= params.max_tokens);
            assert!(chunk.char_end > chunk.char_start);
        }
    }

    #[test]
    fn test_max_chunks_cap() {
        let docs: Vec<SourceDocument> = (0..5)
            .map(|i| SourceDocument {
                source: format!("doc-{i}"),
                text: format!("Fact number {i}."),
            })
            .collect();
        let chunks = chunk_documents(&docs, &ChunkingParams::default(), 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].source, "doc-2");
    }

    #[test]
    fn test_estimate_message_tokens_includes_overhead() {
        let msgs = vec![Message::system(""), Message::user("")];
        assert_eq!(estimate_message_tokens(&msgs), 8);
    }
}
