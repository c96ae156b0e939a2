//! Extractor — turns typed text plus an optional image into one text blob.
//!
//! OCR problems never fail extraction. They come back as a diagnostic next
//! to a result whose `ocr_text` is empty.

use tracing::{info, warn};

use crate::error::OcrError;
use crate::ocr::OcrPool;
use crate::pipeline::types::ExtractedText;

/// Characters of OCR output echoed into the log.
const OCR_LOG_PREVIEW_CHARS: usize = 50;

/// Extraction result plus the non-fatal OCR diagnostic, if any.
#[derive(Debug)]
pub struct Extraction {
    pub text: ExtractedText,
    pub ocr_error: Option<OcrError>,
}

/// Runs OCR through the bounded pool and normalizes the result.
#[derive(Clone)]
pub struct Extractor {
    ocr: OcrPool,
}

impl Extractor {
    pub fn new(ocr: OcrPool) -> Self {
        Self { ocr }
    }

    pub async fn extract(&self, text: &str, image_bytes: Option<Vec<u8>>) -> Extraction {
        let Some(image) = image_bytes else {
            return Extraction {
                text: ExtractedText::new(text, ""),
                ocr_error: None,
            };
        };

        match self.ocr.recognize(image).await {
            Ok(ocr_text) => {
                let ocr_text = ocr_text.trim().to_string();
                if !ocr_text.is_empty() {
                    let preview: String = ocr_text.chars().take(OCR_LOG_PREVIEW_CHARS).collect();
                    info!(preview = %preview, "OCR extracted text");
                }
                Extraction {
                    text: ExtractedText::new(text, ocr_text),
                    ocr_error: None,
                }
            }
            Err(e) => {
                warn!(error = %e, "OCR failed, continuing with message text only");
                Extraction {
                    text: ExtractedText::new(text, ""),
                    ocr_error: Some(e),
                }
            }
        }
    }
}
