//! Document processing pipeline: normalization, chunking, embedding and result assembly.

pub mod chunking;
pub mod normalize;
pub mod sanitize;
mod service;
pub mod types;

pub use chunking::{Chunker, ChunkingOptions};
pub use normalize::{NormalizedDocument, PageSpan, normalize_text};
pub use service::{DocumentPipeline, DocumentProcessor, PipelineSettings};
pub use types::{
    Chunk, ChunkingError, DocumentRequest, DocumentStatus, Embedding, ExtractionResult,
    FormatInfo, Page, PageWarning, PipelineError,
};
