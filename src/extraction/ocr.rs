//! OCR engine adapter: page rasterization and optical character recognition.
//!
//! Both stages shell out: poppler's `pdftoppm` renders pages and `tesseract` reads them.
//! Everything a run writes to disk lives in the run's
//! [`PdfSource`] scratch directory and is removed when the source is dropped.

use async_trait::async_trait;
use image::ImageFormat;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Engine-level OCR failures. Low confidence is not one of them.
#[derive(Debug, Error)]
pub enum OcrEngineError {
    /// External program could not be started.
    #[error("failed to launch {program}: {source}")]
    Launch {
        /// Program that failed to start.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// External program ran but reported failure.
    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        /// Program that failed.
        program: String,
        /// Exit status description.
        status: String,
        /// Captured standard error, trimmed.
        stderr: String,
    },
    /// Page image could not be decoded or re-encoded.
    #[error("invalid page image: {0}")]
    Image(String),
    /// Scratch space could not be prepared.
    #[error("scratch I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Background task running the engine panicked or was cancelled.
    #[error("OCR task aborted: {0}")]
    Aborted(String),
}

/// Grayscale PNG ready to hand to the OCR engine.
#[derive(Debug, Clone)]
pub struct RasterImage {
    /// Encoded PNG bytes.
    pub png: Vec<u8>,
    /// Resolution the image was rendered at (used as a hint when metadata is missing).
    pub dpi: u32,
}

/// Recognized text plus the mean word confidence in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    /// Recognized text with line and paragraph breaks.
    pub text: String,
    /// Mean confidence over recognized words; `0.0` when nothing was recognized.
    pub confidence: f32,
}

/// Renders a single PDF page to a raster image.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    /// Number of pages the renderer sees in `source`.
    ///
    /// Used when the native parser cannot read the document structure.
    async fn page_count(&self, source: &PdfSource) -> Result<usize, OcrEngineError>;

    /// Rasterize the 0-based `page_index` of `source` at `dpi`.
    async fn rasterize(
        &self,
        source: &PdfSource,
        page_index: usize,
        dpi: u32,
    ) -> Result<RasterImage, OcrEngineError>;
}

/// Recognizes text in a raster image.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Run recognition with the given tesseract-style language spec (`eng+deu`).
    async fn recognize(
        &self,
        image: &RasterImage,
        language: &str,
    ) -> Result<OcrOutput, OcrEngineError>;
}

/// One PDF payload plus a lazily created scratch directory for rasterization.
///
/// Cheap to create: nothing touches the filesystem until a page actually needs OCR.
pub struct PdfSource {
    bytes: Arc<[u8]>,
    scratch: OnceCell<(TempDir, PathBuf)>,
}

impl PdfSource {
    /// Wrap the document bytes for one processing run.
    pub fn new(bytes: Arc<[u8]>) -> Self {
        Self {
            bytes,
            scratch: OnceCell::new(),
        }
    }

    /// Path of the PDF inside the scratch directory, writing it on first use.
    pub async fn materialize(&self) -> Result<&Path, std::io::Error> {
        let (_, path) = self
            .scratch
            .get_or_try_init(|| async {
                let dir = tempfile::Builder::new().prefix("docpipe-").tempdir()?;
                let path = dir.path().join("source.pdf");
                tokio::fs::write(&path, &self.bytes).await?;
                tracing::trace!(path = %path.display(), "Materialized PDF for rasterization");
                Ok::<_, std::io::Error>((dir, path))
            })
            .await?;
        Ok(path.as_path())
    }

    /// Scratch directory, if one has been created.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.get().map(|(dir, _)| dir.path())
    }
}

/// Rasterizer shelling out to poppler's `pdftoppm`, with `pdfinfo` for page counts.
#[derive(Debug, Clone)]
pub struct PdftoppmRasterizer {
    program: String,
    pdfinfo: String,
}

impl PdftoppmRasterizer {
    /// Use the given `pdftoppm` and `pdfinfo` binary names or paths.
    pub fn new(program: impl Into<String>, pdfinfo: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            pdfinfo: pdfinfo.into(),
        }
    }
}

impl Default for PdftoppmRasterizer {
    fn default() -> Self {
        Self::new("pdftoppm", "pdfinfo")
    }
}

#[async_trait]
impl PageRasterizer for PdftoppmRasterizer {
    async fn page_count(&self, source: &PdfSource) -> Result<usize, OcrEngineError> {
        let pdf_path = source.materialize().await?.to_path_buf();
        let output = Command::new(&self.pdfinfo)
            .arg(&pdf_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| OcrEngineError::Launch {
                program: self.pdfinfo.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(exit_error(&self.pdfinfo, &output));
        }
        let info = String::from_utf8_lossy(&output.stdout);
        parse_pdfinfo_pages(&info).ok_or_else(|| OcrEngineError::Exit {
            program: self.pdfinfo.clone(),
            status: output.status.to_string(),
            stderr: "no page count in output".to_string(),
        })
    }

    async fn rasterize(
        &self,
        source: &PdfSource,
        page_index: usize,
        dpi: u32,
    ) -> Result<RasterImage, OcrEngineError> {
        let pdf_path = source.materialize().await?.to_path_buf();
        let dir = pdf_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let output_root = dir.join(format!("page-{page_index}"));
        let page_number = (page_index + 1).to_string();

        let output = Command::new(&self.program)
            .arg("-png")
            .arg("-gray")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(&page_number)
            .arg("-l")
            .arg(&page_number)
            .arg("-singlefile")
            .arg(&pdf_path)
            .arg(&output_root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| OcrEngineError::Launch {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(exit_error(&self.program, &output));
        }

        let image_path = output_root.with_extension("png");
        let png = tokio::fs::read(&image_path).await?;
        if let Err(error) = tokio::fs::remove_file(&image_path).await {
            tracing::trace!(error = %error, "Failed to remove rendered page early");
        }
        tracing::trace!(page = page_index, dpi, bytes = png.len(), "Rasterized page");
        Ok(RasterImage { png, dpi })
    }
}

/// OCR engine shelling out to `tesseract`, reading the image from stdin and parsing TSV.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    program: String,
}

impl TesseractEngine {
    /// Use the given binary name or path.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for TesseractEngine {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

#[async_trait]
impl OcrEngine for TesseractEngine {
    async fn recognize(
        &self,
        image: &RasterImage,
        language: &str,
    ) -> Result<OcrOutput, OcrEngineError> {
        let mut child = Command::new(&self.program)
            .arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(language)
            .arg("--dpi")
            .arg(image.dpi.to_string())
            .arg("tsv")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OcrEngineError::Launch {
                program: self.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&image.png).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(exit_error(&self.program, &output));
        }

        let tsv = String::from_utf8_lossy(&output.stdout);
        let recognized = parse_tsv(&tsv);
        tracing::trace!(
            language,
            confidence = recognized.confidence,
            chars = recognized.text.len(),
            "Tesseract recognition finished"
        );
        Ok(recognized)
    }
}

fn exit_error(program: &str, output: &std::process::Output) -> OcrEngineError {
    OcrEngineError::Exit {
        program: program.to_string(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

/// Read the `Pages:` line of `pdfinfo` output.
pub fn parse_pdfinfo_pages(info: &str) -> Option<usize> {
    info.lines()
        .find_map(|line| line.strip_prefix("Pages:"))
        .and_then(|count| count.trim().parse().ok())
}

/// Decode an uploaded raster image and re-encode it as a grayscale PNG.
///
/// Runs on the blocking pool; decoding large scans is CPU bound.
pub async fn prepare_image(bytes: Arc<[u8]>, dpi: u32) -> Result<RasterImage, OcrEngineError> {
    tokio::task::spawn_blocking(move || grayscale_png(&bytes))
        .await
        .map_err(|err| OcrEngineError::Aborted(err.to_string()))?
        .map(|png| RasterImage { png, dpi })
}

fn grayscale_png(bytes: &[u8]) -> Result<Vec<u8>, OcrEngineError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| OcrEngineError::Image(err.to_string()))?;
    let mut png = Vec::new();
    decoded
        .grayscale()
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|err| OcrEngineError::Image(err.to_string()))?;
    Ok(png)
}

/// Parse tesseract TSV output into text and mean word confidence.
///
/// Words on one line are joined with a space, lines with `\n`, and paragraphs or blocks with a
/// blank line. Rows with a negative confidence are layout rows, not words.
pub fn parse_tsv(tsv: &str) -> OcrOutput {
    const WORD_LEVEL: &str = "5";

    let mut text = String::new();
    let mut confidence_sum = 0.0_f64;
    let mut words = 0_usize;
    let mut previous: Option<(&str, &str, &str, &str)> = None;

    for row in tsv.lines() {
        let columns: Vec<&str> = row.split('\t').collect();
        if columns.len() < 12 || columns[0] != WORD_LEVEL {
            continue;
        }
        let word = columns[11].trim();
        let confidence: f64 = columns[10].trim().parse().unwrap_or(-1.0);
        if word.is_empty() || confidence < 0.0 {
            continue;
        }

        let position = (columns[1], columns[2], columns[3], columns[4]);
        if let Some((page, block, paragraph, line)) = previous {
            if (page, block, paragraph) != (position.0, position.1, position.2) {
                text.push_str("\n\n");
            } else if line != position.3 {
                text.push('\n');
            } else {
                text.push(' ');
            }
        }
        text.push_str(word);
        previous = Some(position);

        confidence_sum += confidence;
        words += 1;
    }

    let confidence = if words == 0 {
        0.0
    } else {
        ((confidence_sum / words as f64) / 100.0).clamp(0.0, 1.0) as f32
    };
    OcrOutput { text, confidence }
}
