//! Magic-byte classification of uploaded payloads.

use image::ImageFormat;
use serde::Serialize;
use thiserror::Error;

/// PDF readers accept a header anywhere in the first kilobyte.
const PDF_HEADER_WINDOW: usize = 1024;
const PDF_MAGIC: &[u8] = b"%PDF-";

/// Payload could not be classified as a PDF or a supported raster image.
#[derive(Debug, Error)]
#[error("unsupported document format: {reason}")]
pub struct UnsupportedFormat {
    /// Human readable explanation.
    pub reason: String,
}

impl UnsupportedFormat {
    /// Build an error carrying the given explanation.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Coarse document class driving the extraction strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// Portable Document Format; pages may carry a native text layer.
    Pdf,
    /// Single raster image; always OCR'd.
    Image,
}

/// Raster formats accepted for OCR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// Portable Network Graphics.
    Png,
    /// JPEG / JFIF.
    Jpeg,
    /// Tagged Image File Format.
    Tiff,
    /// Windows bitmap.
    Bmp,
    /// Graphics Interchange Format.
    Gif,
    /// WebP.
    Webp,
}

/// Result of inspecting a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedFormat {
    /// PDF document.
    Pdf,
    /// Raster image of the given kind.
    Image(ImageKind),
}

impl DetectedFormat {
    /// Coarse class of the payload.
    pub fn kind(self) -> DocumentKind {
        match self {
            Self::Pdf => DocumentKind::Pdf,
            Self::Image(_) => DocumentKind::Image,
        }
    }

    /// Canonical MIME type for the detected format.
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Image(ImageKind::Png) => "image/png",
            Self::Image(ImageKind::Jpeg) => "image/jpeg",
            Self::Image(ImageKind::Tiff) => "image/tiff",
            Self::Image(ImageKind::Bmp) => "image/bmp",
            Self::Image(ImageKind::Gif) => "image/gif",
            Self::Image(ImageKind::Webp) => "image/webp",
        }
    }
}

/// Classify `bytes` by their signature.
///
/// The declared content type never decides the outcome; a disagreement is only logged so that
/// mislabelled uploads can be spotted.
pub fn detect_format(
    bytes: &[u8],
    declared: Option<&str>,
) -> Result<DetectedFormat, UnsupportedFormat> {
    if bytes.is_empty() {
        return Err(UnsupportedFormat::new("empty payload"));
    }

    // Image signatures sit at offset 0; the PDF header may drift into the first KiB, where
    // image metadata can also mention it.
    let guessed = image::guess_format(bytes).ok();
    let detected = match guessed.and_then(image_kind) {
        Some(kind) => DetectedFormat::Image(kind),
        None if has_pdf_header(bytes) => DetectedFormat::Pdf,
        None => {
            return Err(match guessed {
                Some(format) => {
                    UnsupportedFormat::new(format!("image format {format:?} is not accepted"))
                }
                None => UnsupportedFormat::new("no PDF or image signature found"),
            });
        }
    };

    if let Some(declared) = declared.map(str::trim).filter(|value| !value.is_empty()) {
        let essence = declared
            .split(';')
            .next()
            .unwrap_or(declared)
            .trim()
            .to_ascii_lowercase();
        if essence != "application/octet-stream" && essence != detected.mime_type() {
            tracing::debug!(
                declared = %essence,
                detected = detected.mime_type(),
                "Declared content type disagrees with payload signature"
            );
        }
    }

    Ok(detected)
}

fn has_pdf_header(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(PDF_HEADER_WINDOW)];
    window
        .windows(PDF_MAGIC.len())
        .any(|candidate| candidate == PDF_MAGIC)
}

fn image_kind(format: ImageFormat) -> Option<ImageKind> {
    match format {
        ImageFormat::Png => Some(ImageKind::Png),
        ImageFormat::Jpeg => Some(ImageKind::Jpeg),
        ImageFormat::Tiff => Some(ImageKind::Tiff),
        ImageFormat::Bmp => Some(ImageKind::Bmp),
        ImageFormat::Gif => Some(ImageKind::Gif),
        ImageFormat::WebP => Some(ImageKind::Webp),
        _ => None,
    }
}
