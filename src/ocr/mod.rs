//! OCR — image bytes to text.
//!
//! The engine itself is a black box that may fail or hang. Every call runs
//! through [`OcrPool`] so a slow image never blocks ingestion.

pub mod pool;
pub mod tesseract;

pub use pool::OcrPool;
pub use tesseract::TesseractCli;

use async_trait::async_trait;

use crate::error::OcrError;

/// OCR engine. Dropping an in-flight `recognize` future must abandon the
/// work (the pool relies on this to enforce its timeout).
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Engine name for logging.
    fn name(&self) -> &str;

    /// Recognize text in an image, using `language` as the engine's hint.
    async fn recognize(&self, image: &[u8], language: &str) -> Result<String, OcrError>;
}

/// Image container formats the monitor will hand to an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
    Bmp,
    Tiff,
}

/// Detect the image format from its magic bytes.
pub fn sniff_image_format(bytes: &[u8]) -> Option<ImageFormat> {
    match bytes {
        [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, ..] => Some(ImageFormat::Png),
        [0xFF, 0xD8, 0xFF, ..] => Some(ImageFormat::Jpeg),
        [b'G', b'I', b'F', b'8', b'7' | b'9', b'a', ..] => Some(ImageFormat::Gif),
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => Some(ImageFormat::Webp),
        [b'B', b'M', ..] => Some(ImageFormat::Bmp),
        [b'I', b'I', 0x2A, 0x00, ..] | [b'M', b'M', 0x00, 0x2A, ..] => Some(ImageFormat::Tiff),
        _ => None,
    }
}
