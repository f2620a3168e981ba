//! Per-page routing between native extraction and OCR fallback.
//!
//! Every page walks the same state machine:
//!
//! ```text
//! unprocessed → native-attempted → native-accepted
//!                                → ocr-attempted → ocr-accepted
//!                                                → ocr-failed (warning)
//! ```
//!
//! Raster images skip the native step entirely. A page's failure is recorded on that page
//! only; the remaining pages are still extracted.

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;

use super::native::{LopdfExtractor, NativeText, NativeTextExtractor, TextLayer};
use super::ocr::{
    OcrEngine, OcrEngineError, OcrOutput, PageRasterizer, PdfSource, PdftoppmRasterizer,
    TesseractEngine, prepare_image,
};

/// How a page's text was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    /// Embedded PDF text layer.
    Native,
    /// Optical character recognition.
    Ocr,
}

/// Terminal state of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageState {
    /// Native text met the sufficiency threshold.
    NativeAccepted,
    /// OCR produced a result (possibly low confidence).
    OcrAccepted,
    /// OCR failed at engine level; the page is degraded to empty text.
    OcrFailed,
}

impl PageState {
    /// Whether the page reached a successful terminal state.
    pub fn is_success(self) -> bool {
        !matches!(self, Self::OcrFailed)
    }
}

/// Decision taken once per page and carried through the rest of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// The text layer is good enough to use as-is.
    NativeSufficient(NativeText),
    /// The page must be rasterized and OCR'd.
    RequiresOcr {
        /// Significant characters the native layer did provide.
        native_chars: usize,
    },
}

impl RouteDecision {
    /// Apply the text-sufficiency heuristic to a native extraction.
    pub fn from_native(native: NativeText, min_chars: usize) -> Self {
        if native.char_count >= min_chars.max(1) {
            Self::NativeSufficient(native)
        } else {
            Self::RequiresOcr {
                native_chars: native.char_count,
            }
        }
    }
}

/// Everything the router learned about one page.
#[derive(Debug)]
pub struct PageOutcome {
    /// 0-based page index.
    pub index: usize,
    /// Method whose output is reported.
    pub method: ExtractionMethod,
    /// Terminal state.
    pub state: PageState,
    /// Raw extracted text; empty for failed pages.
    pub text: String,
    /// OCR confidence, present only for OCR'd pages.
    pub confidence: Option<f32>,
    /// Engine failure for degraded pages.
    pub failure: Option<OcrEngineError>,
}

impl PageOutcome {
    fn native(index: usize, native: NativeText) -> Self {
        Self {
            index,
            method: ExtractionMethod::Native,
            state: PageState::NativeAccepted,
            text: native.text,
            confidence: None,
            failure: None,
        }
    }

    fn ocr(index: usize, output: OcrOutput) -> Self {
        Self {
            index,
            method: ExtractionMethod::Ocr,
            state: PageState::OcrAccepted,
            text: output.text,
            confidence: Some(output.confidence),
            failure: None,
        }
    }

    fn ocr_failed(index: usize, error: OcrEngineError) -> Self {
        Self {
            index,
            method: ExtractionMethod::Ocr,
            state: PageState::OcrFailed,
            text: String::new(),
            confidence: None,
            failure: Some(error),
        }
    }

    /// Warning text for degraded pages.
    pub fn warning(&self) -> Option<String> {
        self.failure
            .as_ref()
            .map(|error| format!("OCR failed on page {}: {error}", self.index))
    }
}

/// Concrete engines used by the router.
#[derive(Clone)]
pub struct ExtractionBackends {
    /// Native PDF text extraction.
    pub native: Arc<dyn NativeTextExtractor>,
    /// PDF page rasterization.
    pub rasterizer: Arc<dyn PageRasterizer>,
    /// Optical character recognition.
    pub ocr: Arc<dyn OcrEngine>,
}

impl ExtractionBackends {
    /// `lopdf` + `pdftoppm`/`pdfinfo` + `tesseract`, with binaries taken from configuration.
    pub fn system(config: &Config) -> Self {
        Self {
            native: Arc::new(LopdfExtractor),
            rasterizer: Arc::new(PdftoppmRasterizer::new(
                config.pdftoppm_bin.clone(),
                config.pdfinfo_bin.clone(),
            )),
            ocr: Arc::new(TesseractEngine::new(config.tesseract_bin.clone())),
        }
    }
}

/// Orchestrates extraction across the pages of one document.
pub struct PageRouter {
    native_min_chars: usize,
    dpi: u32,
    concurrency: usize,
    rasterizer: Arc<dyn PageRasterizer>,
    ocr: Arc<dyn OcrEngine>,
}

impl PageRouter {
    /// Build a router using the given OCR stages.
    pub fn new(
        native_min_chars: usize,
        dpi: u32,
        concurrency: usize,
        rasterizer: Arc<dyn PageRasterizer>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Self {
        Self {
            native_min_chars,
            dpi,
            concurrency: concurrency.max(1),
            rasterizer,
            ocr,
        }
    }

    /// Route every page of a PDF, returning outcomes in page order.
    ///
    /// Up to `concurrency` pages are in flight at once; pages share nothing but `layer` and
    /// `source`, both read-only.
    pub async fn route_pdf(
        &self,
        layer: Arc<dyn TextLayer>,
        source: &PdfSource,
        language: &str,
    ) -> Vec<PageOutcome> {
        let page_count = layer.page_count();
        stream::iter(0..page_count)
            .map(|index| self.route_pdf_page(Arc::clone(&layer), source, index, language))
            .buffered(self.concurrency)
            .collect()
            .await
    }

    async fn route_pdf_page(
        &self,
        layer: Arc<dyn TextLayer>,
        source: &PdfSource,
        index: usize,
        language: &str,
    ) -> PageOutcome {
        let native = tokio::task::spawn_blocking(move || layer.page_text(index))
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(page = index, error = %error, "Native extraction aborted");
                NativeText::empty()
            });

        match RouteDecision::from_native(native, self.native_min_chars) {
            RouteDecision::NativeSufficient(native) => {
                tracing::debug!(page = index, chars = native.char_count, "Native text accepted");
                PageOutcome::native(index, native)
            }
            RouteDecision::RequiresOcr { native_chars } => {
                tracing::debug!(
                    page = index,
                    native_chars,
                    threshold = self.native_min_chars,
                    "Native text insufficient; falling back to OCR"
                );
                let recognized = async {
                    let image = self.rasterizer.rasterize(source, index, self.dpi).await?;
                    self.ocr.recognize(&image, language).await
                }
                .await;
                self.finish_ocr(index, recognized)
            }
        }
    }

    /// Route a raster image document: always a single OCR'd page.
    pub async fn route_image(&self, bytes: Arc<[u8]>, language: &str) -> PageOutcome {
        let recognized = async {
            let image = prepare_image(bytes, self.dpi).await?;
            self.ocr.recognize(&image, language).await
        }
        .await;
        self.finish_ocr(0, recognized)
    }

    fn finish_ocr(
        &self,
        index: usize,
        recognized: Result<OcrOutput, OcrEngineError>,
    ) -> PageOutcome {
        match recognized {
            Ok(output) => {
                tracing::debug!(
                    page = index,
                    confidence = output.confidence,
                    "OCR text accepted"
                );
                PageOutcome::ocr(index, output)
            }
            Err(error) => {
                tracing::warn!(page = index, error = %error, "OCR failed; page degraded");
                PageOutcome::ocr_failed(index, error)
            }
        }
    }
}
