//! Tesseract engine driven through its command-line binary.
//!
//! Runs `tesseract stdin stdout -l <lang>` and feeds the image on stdin.
//! The child is killed if the recognition future is dropped.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::OcrError;
use crate::ocr::{OcrEngine, sniff_image_format};

/// Tesseract CLI engine.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    binary: PathBuf,
}

impl TesseractCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, language: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("stdin")
            .arg("stdout")
            .arg("-l")
            .arg(language)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new("tesseract")
    }
}

#[async_trait]
impl OcrEngine for TesseractCli {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, image: &[u8], language: &str) -> Result<String, OcrError> {
        if sniff_image_format(image).is_none() {
            return Err(OcrError::UnsupportedFormat { len: image.len() });
        }

        let mut child = self.command(language).spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| OcrError::Engine("tesseract stdin unavailable".into()))?;

        // Feed stdin while draining stdout/stderr so a large image cannot
        // deadlock on a full pipe. Stdin is closed when the writer finishes.
        let write = async move {
            stdin.write_all(image).await?;
            stdin.shutdown().await
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OcrError::Engine(format!(
                "tesseract exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        written?;

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
