//! Core data types and error definitions for the processing pipeline.

use anyhow::Error as TokenizerError;
use serde::Serialize;
use thiserror::Error;

use crate::embedding::EmbeddingModelError;
use crate::extraction::{
    DetectedFormat, DocumentKind, ExtractionMethod, ImageKind, OcrEngineError, PageState,
    UnsupportedFormat,
};

/// Errors produced while configuring or running the chunker.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// Chunking configured an impossible target length.
    #[error("chunk target length must be greater than zero")]
    InvalidChunkSize,
    /// Overlap would stop the chunker from making progress.
    #[error("chunk overlap ({overlap}) must be smaller than the target length ({target})")]
    InvalidOverlap {
        /// Requested overlap.
        overlap: usize,
        /// Requested target length.
        target: usize,
    },
    /// Tokenizer resources were unavailable for token-based chunking.
    #[error("failed to initialize tokenizer '{model}': {source}")]
    Tokenizer {
        /// Encoding we attempted to load.
        model: String,
        /// Underlying error raised by the tokenizer library.
        #[source]
        source: TokenizerError,
    },
}

/// Terminal errors of one document run. Every other problem is a page-level warning.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Payload was rejected before any extraction happened.
    #[error(transparent)]
    UnsupportedFormat(#[from] UnsupportedFormat),
    /// OCR failed on every page of the document.
    #[error("OCR failed on all {failed_pages} page(s): {source}")]
    OcrEngine {
        /// Number of pages that failed.
        failed_pages: usize,
        /// Failure reported for the first page.
        #[source]
        source: OcrEngineError,
    },
    /// Chunks could not be embedded.
    #[error(transparent)]
    EmbeddingModel(#[from] EmbeddingModelError),
}

impl PipelineError {
    /// Stable snake_case classification exposed to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::OcrEngine { .. } => "ocr_engine",
            Self::EmbeddingModel(_) => "embedding_model",
        }
    }
}

/// One document submitted for processing.
#[derive(Debug, Clone, Default)]
pub struct DocumentRequest {
    /// Raw payload.
    pub bytes: Vec<u8>,
    /// Content type declared by the uploader, if any.
    pub content_type: Option<String>,
    /// OCR language hint (`eng`, `eng+deu`, ...).
    pub language: Option<String>,
    /// Original file name, used for logging only.
    pub file_name: Option<String>,
}

impl DocumentRequest {
    /// Request for `bytes` without any hints.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            ..Self::default()
        }
    }

    /// Attach a language hint.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Attach the declared content type.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Document-level outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    /// Every page reached a successful terminal state.
    Complete,
    /// Some pages degraded, at least one succeeded.
    Partial,
    /// No page could be processed.
    Failed,
}

impl DocumentStatus {
    /// Fold per-page terminal states into a document status.
    ///
    /// An empty sequence is `Failed`: zero pages could be processed.
    pub fn from_page_states<I>(states: I) -> Self
    where
        I: IntoIterator<Item = PageState>,
    {
        let (succeeded, failed) =
            states
                .into_iter()
                .fold((0usize, 0usize), |(ok, failed), state| {
                    if state.is_success() {
                        (ok + 1, failed)
                    } else {
                        (ok, failed + 1)
                    }
                });
        match (succeeded, failed) {
            (0, _) => Self::Failed,
            (_, 0) => Self::Complete,
            _ => Self::Partial,
        }
    }
}

/// Serialized description of the detected format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FormatInfo {
    /// `pdf` or `image`.
    pub kind: DocumentKind,
    /// Image sub-format, for raster inputs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageKind>,
}

impl From<DetectedFormat> for FormatInfo {
    fn from(format: DetectedFormat) -> Self {
        match format {
            DetectedFormat::Pdf => Self {
                kind: DocumentKind::Pdf,
                image: None,
            },
            DetectedFormat::Image(kind) => Self {
                kind: DocumentKind::Image,
                image: Some(kind),
            },
        }
    }
}

/// Extracted page as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    /// 0-based page index.
    pub index: usize,
    /// How the text was obtained.
    pub method: ExtractionMethod,
    /// Terminal page state.
    pub status: PageState,
    /// Normalized page text.
    pub text: String,
    /// Characters in `text`.
    pub char_count: usize,
    /// Mean OCR confidence in `[0, 1]`, present only for OCR'd pages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// Span of the normalized document text sized for embedding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    /// Position in reading order.
    pub index: usize,
    /// Chunk text, an exact slice of the document text.
    pub text: String,
    /// Start offset (characters) into the document text.
    pub start: usize,
    /// End offset (characters, exclusive) into the document text.
    pub end: usize,
    /// Indices of the pages the span touches.
    pub pages: Vec<usize>,
}

/// Vector bound to a chunk by index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    /// Index of the embedded chunk.
    pub chunk_index: usize,
    /// Model output.
    pub vector: Vec<f32>,
}

/// Non-fatal problem surfaced in the result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageWarning {
    /// Affected page, when the warning is page specific.
    pub page: Option<usize>,
    /// Human readable description.
    pub message: String,
}

/// Full output for one document.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    /// SHA-256 of the input bytes, hex encoded.
    pub document_id: String,
    /// Detected format.
    pub format: FormatInfo,
    /// MIME type matching `format`.
    pub mime_type: &'static str,
    /// Number of pages (1 for images).
    pub page_count: usize,
    /// OCR language the document was processed with.
    pub language: String,
    /// Document-level status.
    pub status: DocumentStatus,
    /// Pages in order.
    pub pages: Vec<Page>,
    /// Chunks in reading order.
    pub chunks: Vec<Chunk>,
    /// One embedding per chunk, in chunk order.
    pub embeddings: Vec<Embedding>,
    /// Model that produced the embeddings.
    pub embedding_model: String,
    /// Width of every embedding vector.
    pub embedding_dimension: usize,
    /// Page-level warnings.
    pub warnings: Vec<PageWarning>,
    /// Completion timestamp (RFC 3339).
    pub processed_at: String,
}
