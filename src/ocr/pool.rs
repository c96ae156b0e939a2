//! Bounded OCR executor.
//!
//! At most `workers` recognitions run at once, each capped by `timeout`.
//! Callers past the bound wait for a permit; the async ingestion path itself
//! is never blocked. A recognition that times out is aborted, which kills
//! any engine subprocess and frees its permit right away.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::OcrError;
use crate::ocr::OcrEngine;

/// Shared, cloneable handle to the OCR worker pool.
#[derive(Clone)]
pub struct OcrPool {
    engine: Arc<dyn OcrEngine>,
    permits: Arc<Semaphore>,
    language: String,
    timeout: Duration,
}

impl OcrPool {
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        workers: usize,
        language: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            language: language.into(),
            timeout,
        }
    }

    /// Permits currently free. Exposed for tests and diagnostics.
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run OCR on `image`, waiting for a free worker first.
    ///
    /// The timeout covers the recognition itself, not the wait for a permit.
    /// Since every recognition is bounded, so is the wait.
    pub async fn recognize(&self, image: Vec<u8>) -> Result<String, OcrError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| OcrError::PoolClosed)?;

        let engine = Arc::clone(&self.engine);
        let language = self.language.clone();
        let len = image.len();

        // Own task so an engine panic surfaces as a JoinError.
        let mut task = tokio::spawn(async move {
            let _permit = permit;
            engine.recognize(&image, &language).await
        });

        debug!(bytes = len, engine = self.engine.name(), "OCR dispatched");

        match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(OcrError::Engine(format!("OCR worker panicked: {join_err}"))),
            Err(_) => {
                task.abort();
                // Wait for the abort so the permit is back before returning.
                let _ = task.await;
                debug!(engine = self.engine.name(), timeout = ?self.timeout, "OCR timed out, aborted");
                Err(OcrError::Timeout(self.timeout))
            }
        }
    }

    /// Stop handing out permits. Pending and future calls fail fast.
    pub fn close(&self) {
        self.permits.close();
    }
}
