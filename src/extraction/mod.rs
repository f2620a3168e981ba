//! Page-level text extraction: format detection, native PDF text, OCR fallback and the
//! router that decides between them for every page.

pub mod format;
pub mod native;
pub mod ocr;
pub mod router;

pub use format::{DetectedFormat, DocumentKind, ImageKind, UnsupportedFormat, detect_format};
pub use native::{EmptyTextLayer, LopdfExtractor, NativeText, NativeTextExtractor, TextLayer};
pub use ocr::{
    OcrEngine, OcrEngineError, OcrOutput, PageRasterizer, PdfSource, PdftoppmRasterizer,
    RasterImage, TesseractEngine,
};
pub use router::{
    ExtractionBackends, ExtractionMethod, PageOutcome, PageRouter, PageState, RouteDecision,
};
