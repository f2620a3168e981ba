//! Boundary-aware chunking of normalized document text.
//!
//! Chunks are exact slices of the document text, measured either in characters or in
//! `cl100k_base` tokens. Highlights:
//!
//! - Boundaries: when a paragraph break (preferred) or a sentence end lies within
//!   `boundary_tolerance` units before the target length, the chunk ends there; otherwise it is
//!   cut at the target length.
//! - Overlap: each chunk after the first starts `overlap` units before the previous chunk ended,
//!   so the tail of chunk `i` is the head of chunk `i + 1`.
//! - Determinism: the output depends only on the text and the options.
//!
//! In token mode, cuts only fall between words and each word costs its token count.

use anyhow::Error as TokenizerError;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base, p50k_base, r50k_base};

use crate::config::{ChunkUnit, Config};

use super::normalize::NormalizedDocument;
use super::types::{Chunk, ChunkingError};

type TokenCounter = Arc<dyn Fn(&str) -> usize + Send + Sync>;

/// Encoding used when chunk lengths are measured in tokens.
pub const TOKEN_ENCODING: &str = "cl100k_base";

/// Chunk sizing, all lengths in `unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingOptions {
    /// Unit lengths are measured in.
    pub unit: ChunkUnit,
    /// Target chunk length.
    pub target_length: usize,
    /// Units shared by consecutive chunks.
    pub overlap: usize,
    /// Look-back window for paragraph and sentence boundaries.
    pub boundary_tolerance: usize,
}

impl From<&Config> for ChunkingOptions {
    fn from(config: &Config) -> Self {
        Self {
            unit: config.chunk_unit,
            target_length: config.chunk_target_length,
            overlap: config.chunk_overlap,
            boundary_tolerance: config.chunk_boundary_tolerance,
        }
    }
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Splits normalized documents into overlapping chunks.
#[derive(Clone)]
pub struct Chunker {
    options: ChunkingOptions,
    counter: Option<TokenCounter>,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Chunker {
    /// Validate `options` and load the tokenizer when counting tokens.
    pub fn new(options: ChunkingOptions) -> Result<Self, ChunkingError> {
        if options.target_length == 0 {
            return Err(ChunkingError::InvalidChunkSize);
        }
        if options.overlap >= options.target_length {
            return Err(ChunkingError::InvalidOverlap {
                overlap: options.overlap,
                target: options.target_length,
            });
        }
        let counter = match options.unit {
            ChunkUnit::Characters => None,
            ChunkUnit::Tokens => Some(build_tiktoken_counter(TOKEN_ENCODING)?),
        };
        Ok(Self { options, counter })
    }

    /// Chunk a document. An empty document yields no chunks.
    pub fn chunk(&self, document: &NormalizedDocument) -> Vec<Chunk> {
        if document.text.trim().is_empty() {
            return Vec::new();
        }
        let layout = Layout::new(&document.text, self.counter.as_ref());
        let n = layout.len();

        let mut chunks = Vec::new();
        let mut start = layout.skip_whitespace(0);
        let mut previous_end = 0usize;
        while start < n {
            let end = self.find_end(&layout, start, previous_end);
            chunks.push(Chunk {
                index: chunks.len(),
                text: layout.slice(&document.text, start, end).to_string(),
                start,
                end,
                pages: document.pages_in(start, end),
            });
            if end >= n {
                break;
            }
            start = self.next_start(&layout, start, end);
            previous_end = end;
        }

        tracing::trace!(
            chunks = chunks.len(),
            unit = ?self.options.unit,
            target = self.options.target_length,
            overlap = self.options.overlap,
            "Chunked document"
        );
        chunks
    }

    fn find_end(&self, layout: &Layout, start: usize, previous_end: usize) -> usize {
        let n = layout.len();
        let floor = start.max(previous_end);
        let budget = layout.prefix[start] + self.options.target_length;
        let reach = layout.prefix.partition_point(|&total| total <= budget) - 1;
        if reach >= n {
            return n;
        }

        let hard = (floor + 1..=reach)
            .rev()
            .find(|&i| layout.can_end[i])
            .or_else(|| (floor + 1..=n).find(|&i| layout.can_end[i]))
            .unwrap_or(n);

        let tolerance_floor = layout.prefix[hard].saturating_sub(self.options.boundary_tolerance);
        let window_start = layout
            .prefix
            .partition_point(|&total| total < tolerance_floor)
            .max(floor + 1);
        let eligible = |c: usize| layout.cost(start, c) > self.options.overlap;

        (window_start..=hard)
            .rev()
            .find(|&c| eligible(c) && layout.is_paragraph_break(c))
            .or_else(|| {
                (window_start..=hard)
                    .rev()
                    .find(|&c| eligible(c) && layout.is_sentence_end(c))
            })
            .unwrap_or(hard)
    }

    fn next_start(&self, layout: &Layout, start: usize, end: usize) -> usize {
        if self.options.overlap > 0 {
            // The overlap must carry text, or the next chunk could be separator only.
            let overlapped = (start + 1..end).find(|&i| {
                layout.can_start[i]
                    && layout.cost(i, end) <= self.options.overlap
                    && layout.has_text(i, end)
            });
            if let Some(next) = overlapped {
                return next;
            }
        }
        layout.skip_whitespace(end)
    }
}

/// Character-indexed view of the text with per-unit costs.
struct Layout {
    chars: Vec<char>,
    byte_offsets: Vec<usize>,
    prefix: Vec<usize>,
    can_start: Vec<bool>,
    can_end: Vec<bool>,
}

impl Layout {
    fn new(text: &str, counter: Option<&TokenCounter>) -> Self {
        let mut chars = Vec::with_capacity(text.len());
        let mut byte_offsets = Vec::with_capacity(text.len() + 1);
        for (offset, c) in text.char_indices() {
            byte_offsets.push(offset);
            chars.push(c);
        }
        byte_offsets.push(text.len());
        let n = chars.len();

        let mut costs = vec![0usize; n];
        let (can_start, can_end) = match counter {
            None => {
                costs.iter_mut().for_each(|cost| *cost = 1);
                (vec![true; n + 1], vec![true; n + 1])
            }
            Some(counter) => {
                let mut can_start = vec![false; n + 1];
                let mut can_end = vec![false; n + 1];
                can_end[n] = true;
                let mut i = 0;
                while i < n {
                    if chars[i].is_whitespace() {
                        i += 1;
                        continue;
                    }
                    let word_start = i;
                    while i < n && !chars[i].is_whitespace() {
                        i += 1;
                    }
                    let word = &text[byte_offsets[word_start]..byte_offsets[i]];
                    costs[word_start] = counter.as_ref()(word).max(1);
                    can_start[word_start] = true;
                    can_end[i] = true;
                }
                (can_start, can_end)
            }
        };

        let mut prefix = Vec::with_capacity(n + 1);
        prefix.push(0);
        for cost in &costs {
            let last = prefix[prefix.len() - 1];
            prefix.push(last + cost);
        }

        Self {
            chars,
            byte_offsets,
            prefix,
            can_start,
            can_end,
        }
    }

    fn len(&self) -> usize {
        self.chars.len()
    }

    fn cost(&self, from: usize, to: usize) -> usize {
        self.prefix[to] - self.prefix[from]
    }

    fn slice<'a>(&self, text: &'a str, start: usize, end: usize) -> &'a str {
        &text[self.byte_offsets[start]..self.byte_offsets[end]]
    }

    fn skip_whitespace(&self, mut index: usize) -> usize {
        while index < self.len() && self.chars[index].is_whitespace() {
            index += 1;
        }
        index
    }

    fn has_text(&self, from: usize, to: usize) -> bool {
        self.chars[from..to].iter().any(|c| !c.is_whitespace())
    }

    fn is_paragraph_break(&self, at: usize) -> bool {
        at + 1 < self.len() && self.chars[at] == '\n' && self.chars[at + 1] == '\n'
    }

    fn is_sentence_end(&self, at: usize) -> bool {
        if at == 0 || at >= self.len() || !self.chars[at].is_whitespace() {
            return false;
        }
        let before = self.chars[at - 1];
        is_terminal(before)
            || (is_closing(before) && at >= 2 && is_terminal(self.chars[at - 2]))
    }
}

fn is_terminal(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…' | '。' | '！' | '？')
}

fn is_closing(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | ']' | '”' | '’' | '»')
}

fn build_tiktoken_counter(name: &str) -> Result<TokenCounter, ChunkingError> {
    let encoding = resolve_encoding(name).map_err(|source| ChunkingError::Tokenizer {
        model: name.to_string(),
        source,
    })?;
    let encoding = Arc::new(encoding);

    Ok(Arc::new(move |segment: &str| {
        encoding.encode_ordinary(segment).len()
    }))
}

fn resolve_encoding(name: &str) -> Result<CoreBPE, TokenizerError> {
    match name {
        "o200k_base" => o200k_base(),
        "p50k_base" => p50k_base(),
        "r50k_base" | "gpt2" => r50k_base(),
        "cl100k_base" => cl100k_base(),
        other => {
            tracing::warn!(
                encoding = other,
                "Unknown encoding; falling back to 'cl100k_base' for token counting"
            );
            cl100k_base()
        }
    }
}
