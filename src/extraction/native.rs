//! Native text extraction from a PDF's embedded text layer.
//!
//! Extraction never rasterizes. A page without usable text yields an empty [`NativeText`]
//! instead of an error: missing text layers are the common case for scanned documents and the
//! router decides what to do about them.

use lopdf::Document;
use std::sync::Arc;

use super::format::UnsupportedFormat;

/// Text pulled from one page's text layer together with its sufficiency signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NativeText {
    /// Raw extracted text, possibly empty.
    pub text: String,
    /// Number of non-whitespace, non-control characters in `text`.
    pub char_count: usize,
}

impl NativeText {
    /// Wrap extracted text, computing its character count.
    pub fn new(text: String) -> Self {
        let char_count = significant_chars(&text);
        Self { text, char_count }
    }

    /// A page without any usable text layer.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Count characters that survive trivial normalization.
pub fn significant_chars(text: &str) -> usize {
    text.chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .count()
}

/// Opens PDF payloads for per-page native text extraction.
pub trait NativeTextExtractor: Send + Sync {
    /// Parse the document structure.
    ///
    /// Fails only when the payload is not a readable PDF at all.
    fn open(&self, bytes: &[u8]) -> Result<Arc<dyn TextLayer>, UnsupportedFormat>;
}

/// Parsed document exposing per-page text.
pub trait TextLayer: Send + Sync {
    /// Number of pages in the document.
    fn page_count(&self) -> usize;

    /// Extract text for the 0-based `index`; returns empty text on any failure.
    fn page_text(&self, index: usize) -> NativeText;
}

/// Stand-in for a document whose structure could not be parsed: every page reports no text,
/// so every page is routed to OCR.
#[derive(Debug, Clone, Copy)]
pub struct EmptyTextLayer {
    pages: usize,
}

impl EmptyTextLayer {
    /// Layer with `pages` blank pages.
    pub fn new(pages: usize) -> Self {
        Self { pages }
    }
}

impl TextLayer for EmptyTextLayer {
    fn page_count(&self) -> usize {
        self.pages
    }

    fn page_text(&self, _index: usize) -> NativeText {
        NativeText::empty()
    }
}

/// Pure-Rust extractor backed by `lopdf`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LopdfExtractor;

impl NativeTextExtractor for LopdfExtractor {
    fn open(&self, bytes: &[u8]) -> Result<Arc<dyn TextLayer>, UnsupportedFormat> {
        let layer = LopdfTextLayer::load(bytes)?;
        Ok(Arc::new(layer))
    }
}

/// A loaded `lopdf` document.
pub struct LopdfTextLayer {
    document: Document,
    page_numbers: Vec<u32>,
}

impl LopdfTextLayer {
    /// Parse `bytes` into a document handle.
    pub fn load(bytes: &[u8]) -> Result<Self, UnsupportedFormat> {
        let document = Document::load_mem(bytes)
            .map_err(|err| UnsupportedFormat::new(format!("unreadable PDF structure: {err}")))?;
        let page_numbers = document.get_pages().keys().copied().collect();
        Ok(Self {
            document,
            page_numbers,
        })
    }
}

impl TextLayer for LopdfTextLayer {
    fn page_count(&self) -> usize {
        self.page_numbers.len()
    }

    fn page_text(&self, index: usize) -> NativeText {
        let Some(&page_number) = self.page_numbers.get(index) else {
            return NativeText::empty();
        };
        match self.document.extract_text(&[page_number]) {
            Ok(text) => NativeText::new(text),
            Err(error) => {
                tracing::debug!(page = index, error = %error, "No native text layer");
                NativeText::empty()
            }
        }
    }
}
