#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use docpipe::embedding::{EmbeddingHost, EmbeddingModel, HashingEmbedder};
use docpipe::extraction::{
    ExtractionBackends, LopdfExtractor, OcrEngine, OcrEngineError, OcrOutput, PageRasterizer,
    PdfSource, RasterImage,
};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};

/// Build a PDF with one page per entry; `None` pages carry no text layer.
pub fn pdf_with_pages(pages: &[Option<&str>]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let operations = match text {
            Some(text) => vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
            None => Vec::new(),
        };
        let content = Content { operations };
        let content_id =
            doc.add_object(Stream::new(dictionary! {}, content.encode().expect("encode")));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("save pdf");
    bytes
}

/// A small white PNG.
pub fn blank_png() -> Vec<u8> {
    let image = image::GrayImage::from_pixel(8, 8, image::Luma([255u8]));
    let mut bytes = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .expect("encode png");
    bytes
}

/// Rasterizer that tags each image with its page index instead of rendering.
#[derive(Default)]
pub struct TaggingRasterizer {
    pub pages: Mutex<Vec<usize>>,
}

#[async_trait]
impl PageRasterizer for TaggingRasterizer {
    async fn page_count(&self, _source: &PdfSource) -> Result<usize, OcrEngineError> {
        Ok(0)
    }

    async fn rasterize(
        &self,
        _source: &PdfSource,
        page_index: usize,
        dpi: u32,
    ) -> Result<RasterImage, OcrEngineError> {
        self.pages.lock().unwrap().push(page_index);
        Ok(RasterImage {
            png: vec![page_index as u8],
            dpi,
        })
    }
}

/// OCR engine returning canned text, optionally failing for chosen pages.
#[derive(Default)]
pub struct ScriptedOcr {
    pub failing_pages: Vec<u8>,
    pub calls: AtomicUsize,
}

impl ScriptedOcr {
    pub fn failing(pages: &[u8]) -> Self {
        Self {
            failing_pages: pages.to_vec(),
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for ScriptedOcr {
    async fn recognize(
        &self,
        image: &RasterImage,
        _language: &str,
    ) -> Result<OcrOutput, OcrEngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let page = image.png.first().copied().unwrap_or_default();
        if self.failing_pages.contains(&page) {
            return Err(OcrEngineError::Exit {
                program: "tesseract".into(),
                status: "exit status: 1".into(),
                stderr: "simulated crash".into(),
            });
        }
        Ok(OcrOutput {
            text: format!("Scanned page number {page}. It was recog-\nnized optically."),
            confidence: 0.87,
        })
    }
}

/// Real lopdf native extraction with scripted OCR stages.
pub fn backends(rasterizer: Arc<TaggingRasterizer>, ocr: Arc<ScriptedOcr>) -> ExtractionBackends {
    ExtractionBackends {
        native: Arc::new(LopdfExtractor),
        rasterizer,
        ocr,
    }
}

/// Hashing embedding host with the given width.
pub fn hashing_host(dimension: usize) -> Arc<EmbeddingHost> {
    Arc::new(EmbeddingHost::new(
        format!("hashing-{dimension}"),
        dimension,
        8,
        Arc::new(move || Ok(Box::new(HashingEmbedder::new(dimension)) as Box<dyn EmbeddingModel>)),
    ))
}
