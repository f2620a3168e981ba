//! Text cleanup applied to every page before chunking.
//!
//! Normalization keeps paragraph structure (a blank line) because the chunker prefers to cut
//! there, and flattens everything else to single spaces.

use regex::Regex;
use std::sync::LazyLock;

/// Hyphen at the end of a line followed by a lowercase continuation: `exam-\nple`.
static LINE_WRAP_HYPHEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\p{L})-[ \t]*\n[ \t]*(\p{Ll})").expect("Invalid de-hyphenation pattern")
});

/// Separator inserted between paragraphs and between pages.
pub const PARAGRAPH_BREAK: &str = "\n\n";

/// Clean raw extracted text.
///
/// - line endings, form feeds and vertical tabs become `\n`
/// - control characters, soft hyphens and zero-width characters are removed
/// - words hyphenated across a line break are re-joined
/// - whitespace runs collapse to one space; blank lines separate paragraphs
pub fn normalize_text(raw: &str) -> String {
    let unified: String = raw
        .replace("\r\n", "\n")
        .chars()
        .filter_map(|c| match c {
            '\r' | '\u{0b}' | '\u{0c}' => Some('\n'),
            '\t' => Some(' '),
            '\n' => Some('\n'),
            '\u{ad}' | '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{feff}' => None,
            c if c.is_control() => None,
            c => Some(c),
        })
        .collect();

    let joined = LINE_WRAP_HYPHEN.replace_all(&unified, "$1$2");

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in joined.split('\n') {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(collapse(&current));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(collapse(&current));
    }
    paragraphs.join(PARAGRAPH_BREAK)
}

fn collapse(lines: &[&str]) -> String {
    lines
        .iter()
        .flat_map(|line| line.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Where a page's text lives inside the assembled document, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    /// 0-based page index.
    pub page: usize,
    /// First character of the page.
    pub start: usize,
    /// One past the last character of the page.
    pub end: usize,
}

/// Concatenated document text plus the page boundaries inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedDocument {
    /// Pages joined with [`PARAGRAPH_BREAK`].
    pub text: String,
    /// One span per non-empty page, in order.
    pub spans: Vec<PageSpan>,
}

impl NormalizedDocument {
    /// Join already normalized page texts; empty pages contribute nothing.
    pub fn assemble<'a, I>(pages: I) -> Self
    where
        I: IntoIterator<Item = (usize, &'a str)>,
    {
        let mut text = String::new();
        let mut spans = Vec::new();
        let mut cursor = 0usize;
        for (page, page_text) in pages {
            if page_text.is_empty() {
                continue;
            }
            if !text.is_empty() {
                text.push_str(PARAGRAPH_BREAK);
                cursor += PARAGRAPH_BREAK.chars().count();
            }
            let length = page_text.chars().count();
            text.push_str(page_text);
            spans.push(PageSpan {
                page,
                start: cursor,
                end: cursor + length,
            });
            cursor += length;
        }
        Self { text, spans }
    }

    /// Pages overlapping the character range `[start, end)`.
    pub fn pages_in(&self, start: usize, end: usize) -> Vec<usize> {
        self.spans
            .iter()
            .filter(|span| span.start < end && start < span.end)
            .map(|span| span.page)
            .collect()
    }

    /// Whether the document has no text at all.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}
