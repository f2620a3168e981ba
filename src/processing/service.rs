//! Pipeline orchestrator: format detection, page routing, normalization, chunking and embedding.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::Config,
    embedding::{EmbeddingHost, global_host},
    extraction::{
        DetectedFormat, EmptyTextLayer, ExtractionBackends, OcrEngineError, PageOutcome,
        PageRouter, PageState, PdfSource, TextLayer, UnsupportedFormat, detect_format,
    },
    metrics::{MetricsSnapshot, PipelineMetrics},
    processing::{
        chunking::{Chunker, ChunkingOptions},
        normalize::{NormalizedDocument, normalize_text},
        sanitize::{sanitize_file_name, sanitize_language},
        types::{
            ChunkingError, DocumentRequest, DocumentStatus, Embedding, ExtractionResult,
            FormatInfo, Page, PageWarning, PipelineError,
        },
    },
};

/// Abstraction over the pipeline used by external surfaces (HTTP, CLI).
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    /// Extract, chunk and embed one document.
    async fn process_document(
        &self,
        request: DocumentRequest,
    ) -> Result<ExtractionResult, PipelineError>;

    /// Retrieve the current metrics snapshot for diagnostics.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Tunables of a pipeline instance.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// OCR language used when a request carries no usable hint.
    pub default_language: String,
    /// Native-text sufficiency threshold.
    pub native_text_min_chars: usize,
    /// Rasterization resolution.
    pub ocr_dpi: u32,
    /// Pages extracted concurrently.
    pub page_concurrency: usize,
    /// Documents processed concurrently.
    pub max_concurrent_documents: usize,
    /// Chunk sizing.
    pub chunking: ChunkingOptions,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            default_language: config.ocr_languages.clone(),
            native_text_min_chars: config.native_text_min_chars,
            ocr_dpi: config.ocr_dpi,
            page_concurrency: config.page_concurrency,
            max_concurrent_documents: config.max_concurrent_documents,
            chunking: ChunkingOptions::from(config),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Composes the extraction stages into a single "process document" operation.
///
/// Construct once near process start and share it through an `Arc`; the embedding host it
/// holds is the only long-lived heavy resource.
pub struct DocumentPipeline {
    settings: PipelineSettings,
    backends: ExtractionBackends,
    router: PageRouter,
    chunker: Chunker,
    embedder: Arc<EmbeddingHost>,
    metrics: Arc<PipelineMetrics>,
    permits: Semaphore,
}

impl DocumentPipeline {
    /// Assemble a pipeline from explicit parts.
    pub fn new(
        settings: PipelineSettings,
        backends: ExtractionBackends,
        embedder: Arc<EmbeddingHost>,
    ) -> Result<Self, ChunkingError> {
        let chunker = Chunker::new(settings.chunking)?;
        let router = PageRouter::new(
            settings.native_text_min_chars,
            settings.ocr_dpi,
            settings.page_concurrency,
            Arc::clone(&backends.rasterizer),
            Arc::clone(&backends.ocr),
        );
        let permits = Semaphore::new(settings.max_concurrent_documents.max(1));
        Ok(Self {
            settings,
            backends,
            router,
            chunker,
            embedder,
            metrics: Arc::new(PipelineMetrics::new()),
            permits,
        })
    }

    /// Pipeline using the system OCR tools and the process-wide embedding host.
    pub fn from_config(config: &Config) -> Result<Self, ChunkingError> {
        tracing::info!(
            backend = ?config.embedding_backend,
            model = %config.embedding_model,
            "Initializing document pipeline"
        );
        Self::new(
            PipelineSettings::from(config),
            ExtractionBackends::system(config),
            global_host(config),
        )
    }

    /// Run one document through the pipeline.
    pub async fn process(
        &self,
        request: DocumentRequest,
    ) -> Result<ExtractionResult, PipelineError> {
        // The semaphore is never closed; a failed acquire just means no throttling.
        let _permit = self.permits.acquire().await.ok();
        let document_id = hex::encode(Sha256::digest(&request.bytes));
        let span = tracing::info_span!(
            "document",
            request_id = %Uuid::new_v4(),
            document_id = %document_id,
        );
        let result = self.run(request, document_id).instrument(span).await;
        match &result {
            Ok(result) => self
                .metrics
                .record_document(result.status, result.chunks.len() as u64),
            Err(_) => self.metrics.record_failure(),
        }
        result
    }

    async fn run(
        &self,
        request: DocumentRequest,
        document_id: String,
    ) -> Result<ExtractionResult, PipelineError> {
        let started = Instant::now();
        let DocumentRequest {
            bytes,
            content_type,
            language,
            file_name,
        } = request;

        let format = detect_format(&bytes, content_type.as_deref()).inspect_err(|error| {
            tracing::warn!(error = %error, "Rejected document");
        })?;
        let language = sanitize_language(language, &self.settings.default_language);
        tracing::info!(
            format = format.mime_type(),
            bytes = bytes.len(),
            file = ?sanitize_file_name(file_name),
            language = %language,
            "Processing document"
        );

        let bytes: Arc<[u8]> = Arc::from(bytes);
        let outcomes = match format {
            DetectedFormat::Pdf => self.extract_pdf(bytes, &language).await?,
            DetectedFormat::Image(_) => vec![self.router.route_image(bytes, &language).await],
        };
        let page_count = outcomes.len();
        for outcome in &outcomes {
            self.metrics.record_page(outcome.state);
        }

        let status = DocumentStatus::from_page_states(outcomes.iter().map(|page| page.state));
        if status == DocumentStatus::Failed {
            let source = outcomes
                .into_iter()
                .find_map(|page| page.failure)
                .unwrap_or_else(|| OcrEngineError::Aborted("no page produced output".into()));
            tracing::warn!(pages = page_count, error = %source, "OCR failed on every page");
            return Err(PipelineError::OcrEngine {
                failed_pages: page_count,
                source,
            });
        }

        let (pages, mut warnings) = collect_pages(outcomes);
        let document =
            NormalizedDocument::assemble(pages.iter().map(|page| (page.index, page.text.as_str())));
        if document.is_empty() {
            warnings.push(PageWarning {
                page: None,
                message: "document contains no extractable text".into(),
            });
        }

        let chunks = self.chunker.chunk(&document);
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = self.embedder.embed(texts).await.inspect_err(|error| {
            tracing::error!(error = %error, chunks = chunks.len(), "Embedding failed");
        })?;
        let embeddings: Vec<Embedding> = vectors
            .into_iter()
            .enumerate()
            .map(|(chunk_index, vector)| Embedding {
                chunk_index,
                vector,
            })
            .collect();

        tracing::info!(
            status = ?status,
            pages = page_count,
            chunks = chunks.len(),
            warnings = warnings.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Document processed"
        );

        Ok(ExtractionResult {
            document_id,
            format: FormatInfo::from(format),
            mime_type: format.mime_type(),
            page_count,
            language,
            status,
            pages,
            chunks,
            embeddings,
            embedding_model: self.embedder.model_name().to_string(),
            embedding_dimension: self.embedder.dimension(),
            warnings,
            processed_at: current_timestamp_rfc3339(),
        })
    }

    async fn extract_pdf(
        &self,
        bytes: Arc<[u8]>,
        language: &str,
    ) -> Result<Vec<PageOutcome>, PipelineError> {
        let native = Arc::clone(&self.backends.native);
        let payload = Arc::clone(&bytes);
        let opened = tokio::task::spawn_blocking(move || native.open(&payload))
            .await
            .map_err(|error| UnsupportedFormat::new(format!("PDF parser aborted: {error}")))?;

        // Rasterized pages live in the source's scratch directory until it is dropped here.
        let source = PdfSource::new(bytes);
        let layer = match opened {
            Ok(layer) => layer,
            Err(unreadable) => self.ocr_only_layer(&source, unreadable).await?,
        };
        if layer.page_count() == 0 {
            return Err(UnsupportedFormat::new("PDF contains no pages").into());
        }
        Ok(self.router.route_pdf(layer, &source, language).await)
    }

    /// Let the renderer count pages when the native parser cannot read the structure.
    async fn ocr_only_layer(
        &self,
        source: &PdfSource,
        unreadable: UnsupportedFormat,
    ) -> Result<Arc<dyn TextLayer>, UnsupportedFormat> {
        match self.backends.rasterizer.page_count(source).await {
            Ok(pages) => {
                tracing::warn!(
                    error = %unreadable,
                    pages,
                    "Native parser rejected the PDF; routing every page to OCR"
                );
                Ok(Arc::new(EmptyTextLayer::new(pages)))
            }
            Err(error) => {
                tracing::warn!(
                    parser = %unreadable,
                    renderer = %error,
                    "PDF is unreadable by both parser and renderer"
                );
                Err(unreadable)
            }
        }
    }
}

fn collect_pages(outcomes: Vec<PageOutcome>) -> (Vec<Page>, Vec<PageWarning>) {
    let mut warnings = Vec::new();
    let pages = outcomes
        .into_iter()
        .map(|outcome| {
            if let Some(message) = outcome.warning() {
                warnings.push(PageWarning {
                    page: Some(outcome.index),
                    message,
                });
            }
            let text = normalize_text(&outcome.text);
            if text.is_empty() && outcome.state != PageState::OcrFailed {
                warnings.push(PageWarning {
                    page: Some(outcome.index),
                    message: format!("page {} produced no text", outcome.index),
                });
            }
            Page {
                index: outcome.index,
                method: outcome.method,
                status: outcome.state,
                char_count: text.chars().count(),
                text,
                confidence: outcome.confidence,
            }
        })
        .collect();
    (pages, warnings)
}

fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[async_trait]
impl DocumentProcessor for DocumentPipeline {
    async fn process_document(
        &self,
        request: DocumentRequest,
    ) -> Result<ExtractionResult, PipelineError> {
        self.process(request).await
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChunkUnit;
    use crate::embedding::{EmbeddingModel, EmbeddingModelError, HashingEmbedder};
    use crate::extraction::{
        ExtractionMethod, NativeText, NativeTextExtractor, OcrEngine, OcrOutput, PageRasterizer,
        RasterImage, TextLayer,
    };
    use std::collections::HashSet;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Native layer whose pages are given up front; `None` means "no text layer".
    struct StubExtractor {
        pages: Vec<Option<&'static str>>,
        unreadable: bool,
        opened: AtomicUsize,
    }

    struct StubLayer(Vec<Option<&'static str>>);

    impl NativeTextExtractor for StubExtractor {
        fn open(&self, _bytes: &[u8]) -> Result<Arc<dyn TextLayer>, UnsupportedFormat> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            if self.unreadable {
                return Err(UnsupportedFormat::new("unreadable PDF structure"));
            }
            Ok(Arc::new(StubLayer(self.pages.clone())))
        }
    }

    impl TextLayer for StubLayer {
        fn page_count(&self) -> usize {
            self.0.len()
        }

        fn page_text(&self, index: usize) -> NativeText {
            self.0[index]
                .map(|text| NativeText::new(text.to_string()))
                .unwrap_or_default()
        }
    }

    /// Renderer; `rendered_pages` is what it reports for documents the parser rejects.
    struct StubRasterizer {
        rendered_pages: Option<usize>,
    }

    #[async_trait]
    impl PageRasterizer for StubRasterizer {
        async fn page_count(&self, _source: &PdfSource) -> Result<usize, OcrEngineError> {
            self.rendered_pages.ok_or_else(|| OcrEngineError::Exit {
                program: "pdfinfo".into(),
                status: "exit status: 1".into(),
                stderr: "Syntax Error: Couldn't read xref table".into(),
            })
        }

        async fn rasterize(
            &self,
            _source: &PdfSource,
            page_index: usize,
            dpi: u32,
        ) -> Result<RasterImage, OcrEngineError> {
            Ok(RasterImage {
                png: vec![page_index as u8],
                dpi,
            })
        }
    }

    #[derive(Default)]
    struct StubOcr {
        failing_pages: HashSet<u8>,
        fail_all: bool,
        blank: bool,
        calls: AtomicUsize,
        languages: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl OcrEngine for StubOcr {
        async fn recognize(
            &self,
            image: &RasterImage,
            language: &str,
        ) -> Result<OcrOutput, OcrEngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.languages.lock().unwrap().push(language.to_string());
            let marker = image.png.first().copied().unwrap_or_default();
            if self.fail_all || self.failing_pages.contains(&marker) {
                return Err(OcrEngineError::Aborted("simulated engine crash".into()));
            }
            if self.blank {
                return Ok(OcrOutput {
                    text: String::new(),
                    confidence: 0.0,
                });
            }
            Ok(OcrOutput {
                text: format!("Scanned page {marker} con-\ntent."),
                confidence: 0.9,
            })
        }
    }

    struct FailingModel;

    impl EmbeddingModel for FailingModel {
        fn dimension(&self) -> usize {
            16
        }

        fn embed_batch(&mut self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingModelError> {
            Err(EmbeddingModelError::Inference("out of memory".into()))
        }
    }

    fn hashing_host() -> Arc<EmbeddingHost> {
        Arc::new(EmbeddingHost::new(
            "hashing-16",
            16,
            4,
            Arc::new(|| Ok(Box::new(HashingEmbedder::new(16)) as Box<dyn EmbeddingModel>)),
        ))
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            chunking: ChunkingOptions {
                unit: ChunkUnit::Characters,
                target_length: 40,
                overlap: 8,
                boundary_tolerance: 15,
            },
            ..PipelineSettings::default()
        }
    }

    fn pipeline_with(
        pages: Vec<Option<&'static str>>,
        ocr: Arc<StubOcr>,
        embedder: Arc<EmbeddingHost>,
    ) -> (DocumentPipeline, Arc<StubExtractor>) {
        build_pipeline(pages, false, None, ocr, embedder)
    }

    fn unreadable_pipeline(
        rendered_pages: Option<usize>,
        ocr: Arc<StubOcr>,
    ) -> (DocumentPipeline, Arc<StubExtractor>) {
        build_pipeline(vec![], true, rendered_pages, ocr, hashing_host())
    }

    fn build_pipeline(
        pages: Vec<Option<&'static str>>,
        unreadable: bool,
        rendered_pages: Option<usize>,
        ocr: Arc<StubOcr>,
        embedder: Arc<EmbeddingHost>,
    ) -> (DocumentPipeline, Arc<StubExtractor>) {
        let extractor = Arc::new(StubExtractor {
            pages,
            unreadable,
            opened: AtomicUsize::new(0),
        });
        let backends = ExtractionBackends {
            native: extractor.clone(),
            rasterizer: Arc::new(StubRasterizer { rendered_pages }),
            ocr,
        };
        let pipeline = DocumentPipeline::new(settings(), backends, embedder).expect("pipeline");
        (pipeline, extractor)
    }

    fn pdf_request() -> DocumentRequest {
        DocumentRequest::new(b"%PDF-1.7\n...".to_vec())
    }

    fn png_bytes() -> Vec<u8> {
        let image = image::GrayImage::from_pixel(4, 4, image::Luma([255u8]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("encode png");
        bytes
    }

    #[tokio::test]
    async fn mixed_pdf_routes_pages_and_completes() {
        let ocr = Arc::new(StubOcr::default());
        let (pipeline, _) = pipeline_with(
            vec![Some("Hello world"), None, None],
            ocr.clone(),
            hashing_host(),
        );

        let result = pipeline.process(pdf_request()).await.expect("result");

        let methods: Vec<ExtractionMethod> = result.pages.iter().map(|p| p.method).collect();
        assert_eq!(
            methods,
            vec![
                ExtractionMethod::Native,
                ExtractionMethod::Ocr,
                ExtractionMethod::Ocr
            ]
        );
        assert_eq!(result.status, DocumentStatus::Complete);
        assert_eq!(result.page_count, 3);
        assert_eq!(result.pages[0].text, "Hello world");
        assert!(result.pages[0].confidence.is_none());
        assert_eq!(result.pages[1].text, "Scanned page 1 content.");
        assert_eq!(result.pages[1].confidence, Some(0.9));
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 2);
        assert!(result.warnings.is_empty());

        assert!(!result.chunks.is_empty());
        assert_eq!(result.embeddings.len(), result.chunks.len());
        for (index, (chunk, embedding)) in
            result.chunks.iter().zip(&result.embeddings).enumerate()
        {
            assert_eq!(chunk.index, index);
            assert_eq!(embedding.chunk_index, index);
            assert_eq!(embedding.vector.len(), 16);
        }
        assert!(result.chunks.windows(2).all(|pair| pair[0].start < pair[1].start));
        assert_eq!(result.document_id.len(), 64);
        assert_eq!(result.mime_type, "application/pdf");

        let metrics = pipeline.metrics_snapshot();
        assert_eq!((metrics.pages_native, metrics.pages_ocr), (1, 2));
    }

    #[tokio::test]
    async fn empty_input_is_unsupported() {
        let (pipeline, extractor) =
            pipeline_with(vec![], Arc::new(StubOcr::default()), hashing_host());
        let error = pipeline
            .process(DocumentRequest::new(Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(error, PipelineError::UnsupportedFormat(_)));
        assert_eq!(extractor.opened.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.metrics_snapshot().documents_failed, 1);
    }

    #[tokio::test]
    async fn pdf_without_pages_is_unsupported() {
        let (pipeline, _) = pipeline_with(vec![], Arc::new(StubOcr::default()), hashing_host());
        let error = pipeline.process(pdf_request()).await.unwrap_err();
        assert_eq!(error.kind(), "unsupported_format");
    }

    #[tokio::test]
    async fn unparseable_pdf_falls_back_to_ocr_for_every_page() {
        let ocr = Arc::new(StubOcr::default());
        let (pipeline, extractor) = unreadable_pipeline(Some(2), ocr.clone());

        let result = pipeline.process(pdf_request()).await.expect("result");

        assert_eq!(extractor.opened.load(Ordering::SeqCst), 1);
        assert_eq!(result.status, DocumentStatus::Complete);
        assert_eq!(result.page_count, 2);
        assert!(
            result
                .pages
                .iter()
                .all(|page| page.method == ExtractionMethod::Ocr)
        );
        assert_eq!(result.pages[1].text, "Scanned page 1 content.");
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pdf_unreadable_by_parser_and_renderer_is_unsupported() {
        let ocr = Arc::new(StubOcr::default());
        let (pipeline, _) = unreadable_pipeline(None, ocr.clone());
        let error = pipeline.process(pdf_request()).await.unwrap_err();
        assert!(matches!(error, PipelineError::UnsupportedFormat(_)));
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_page_ocr_failure_is_partial() {
        let ocr = Arc::new(StubOcr {
            failing_pages: HashSet::from([1]),
            ..StubOcr::default()
        });
        let (pipeline, _) = pipeline_with(
            vec![Some("Native first page text"), None, None],
            ocr,
            hashing_host(),
        );

        let result = pipeline.process(pdf_request()).await.expect("partial result");

        assert_eq!(result.status, DocumentStatus::Partial);
        assert_eq!(result.pages.len(), 3);
        assert_eq!(result.pages[1].status, PageState::OcrFailed);
        assert_eq!(result.pages[1].text, "");
        assert_eq!(result.pages[2].status, PageState::OcrAccepted);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].page, Some(1));
        assert!(result.chunks.iter().all(|chunk| !chunk.pages.contains(&1)));
        assert_eq!(pipeline.metrics_snapshot().documents_partial, 1);
    }

    #[tokio::test]
    async fn ocr_failure_on_every_page_is_fatal() {
        let ocr = Arc::new(StubOcr {
            fail_all: true,
            ..StubOcr::default()
        });
        let (pipeline, _) = pipeline_with(vec![None, None], ocr, hashing_host());
        let error = pipeline.process(pdf_request()).await.unwrap_err();
        assert!(matches!(
            error,
            PipelineError::OcrEngine {
                failed_pages: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn image_input_never_touches_native_extraction() {
        let ocr = Arc::new(StubOcr::default());
        let (pipeline, extractor) =
            pipeline_with(vec![Some("unused")], ocr.clone(), hashing_host());
        let request = DocumentRequest::new(png_bytes()).with_language("deu");

        let result = pipeline.process(request).await.expect("result");

        assert_eq!(extractor.opened.load(Ordering::SeqCst), 0);
        assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.page_count, 1);
        assert_eq!(result.pages[0].method, ExtractionMethod::Ocr);
        assert_eq!(result.language, "deu");
        assert_eq!(ocr.languages.lock().unwrap().as_slice(), ["deu".to_string()]);
        assert_eq!(result.mime_type, "image/png");
    }

    #[tokio::test]
    async fn invalid_language_hint_uses_default() {
        let ocr = Arc::new(StubOcr::default());
        let (pipeline, _) = pipeline_with(vec![None], ocr.clone(), hashing_host());
        let result = pipeline
            .process(pdf_request().with_language("eng; rm -rf /"))
            .await
            .expect("result");
        assert_eq!(result.language, "eng");
        assert_eq!(ocr.languages.lock().unwrap().as_slice(), ["eng".to_string()]);
    }

    #[tokio::test]
    async fn embedding_errors_propagate() {
        let host = Arc::new(EmbeddingHost::new(
            "failing",
            16,
            4,
            Arc::new(|| Ok(Box::new(FailingModel) as Box<dyn EmbeddingModel>)),
        ));
        let (pipeline, _) =
            pipeline_with(vec![Some("Hello world")], Arc::new(StubOcr::default()), host);
        let error = pipeline.process(pdf_request()).await.unwrap_err();
        assert_eq!(error.kind(), "embedding_model");
    }

    #[tokio::test]
    async fn blank_document_has_no_chunks_and_a_warning() {
        let ocr = Arc::new(StubOcr {
            blank: true,
            ..StubOcr::default()
        });
        let (pipeline, _) = pipeline_with(vec![Some("   \n  ")], ocr, hashing_host());

        let result = pipeline.process(pdf_request()).await.expect("result");

        assert_eq!(result.status, DocumentStatus::Complete);
        assert_eq!(result.pages[0].method, ExtractionMethod::Ocr);
        assert!(result.chunks.is_empty());
        assert!(result.embeddings.is_empty());
        let pages: Vec<Option<usize>> = result.warnings.iter().map(|w| w.page).collect();
        assert_eq!(pages, vec![Some(0), None]);
    }
}
