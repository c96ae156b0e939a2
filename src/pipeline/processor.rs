//! Pipeline coordinator — runs every event through
//! extract → persist → match → alert.
//!
//! **Core invariant: one Message row and at most one Alert per
//! `(channel_id, source_message_id)`**, however often the listener
//! redelivers an event. Uniqueness lives in the store; this module never
//! locks.
//!
//! Events from one channel are processed in arrival order by a dedicated
//! worker; different channels run concurrently.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::EventStream;
use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::alerts::AlertEngine;
use crate::pipeline::extractor::Extractor;
use crate::pipeline::matcher::{KeywordSet, match_keywords};
use crate::pipeline::types::{InboundEvent, ProcessOutcome, Stage};
use crate::store::{AlertStatus, Database, StoredMessage};

/// First delay between store retries; doubles per attempt.
const PERSIST_RETRY_BASE: Duration = Duration::from_millis(100);

/// Default number of store retries before an event is given up on.
pub const DEFAULT_PERSIST_RETRIES: u32 = 5;

/// Default per-channel queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Counters for one `run`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub processed: u64,
    pub alerted: u64,
    pub duplicates: u64,
    pub failed: u64,
}

impl RunStats {
    fn record(&mut self, outcome: &ProcessOutcome) {
        self.processed += 1;
        match outcome {
            ProcessOutcome::Alerted { .. } => self.alerted += 1,
            ProcessOutcome::Duplicate { .. } => self.duplicates += 1,
            ProcessOutcome::NoMatch => {}
        }
    }

    fn merge(&mut self, other: RunStats) {
        self.processed += other.processed;
        self.alerted += other.alerted;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }
}

/// The coordinator. Cheap to share behind an `Arc`.
pub struct Pipeline {
    extractor: Extractor,
    db: Arc<dyn Database>,
    keywords: Arc<KeywordSet>,
    alerts: Arc<AlertEngine>,
    persist_retries: u32,
    queue_capacity: usize,
}

impl Pipeline {
    pub fn new(
        extractor: Extractor,
        db: Arc<dyn Database>,
        keywords: Arc<KeywordSet>,
        alerts: Arc<AlertEngine>,
    ) -> Self {
        Self {
            extractor,
            db,
            keywords,
            alerts,
            persist_retries: DEFAULT_PERSIST_RETRIES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_persist_retries(mut self, retries: u32) -> Self {
        self.persist_retries = retries;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Process a single event through the full state machine.
    ///
    /// Only store failures surface as errors; OCR problems degrade and
    /// delivery problems leave the alert pending.
    pub async fn process(&self, mut event: InboundEvent) -> Result<ProcessOutcome, PipelineError> {
        let channel = event.channel_id.clone();
        let source_id = event.source_message_id.clone();
        debug!(
            channel = %channel,
            source_id = %source_id,
            stage = %Stage::Received,
            has_image = event.has_image,
            "Processing event"
        );

        // Known identity: skip OCR entirely.
        if let Some(existing) = self
            .with_retry(Stage::Received, &channel, &source_id, || {
                self.db.get_message_by_identity(&channel, &source_id)
            })
            .await?
        {
            return self.finish_duplicate(existing).await;
        }

        let extraction = self
            .extractor
            .extract(&event.text, event.image_bytes.take())
            .await;
        if let Some(ocr_error) = &extraction.ocr_error {
            warn!(
                channel = %channel,
                source_id = %source_id,
                stage = %Stage::Extracted,
                error = %ocr_error,
                "OCR degraded to message text only"
            );
        }

        let record = StoredMessage::from_event(&event, extraction.text);
        let persisted = self
            .with_retry(Stage::Persisted, &channel, &source_id, || {
                self.db.persist_message(&record)
            })
            .await?;

        if !persisted.created {
            // Lost a race with a concurrent pass for the same identity.
            return self.finish_duplicate(persisted.existing).await;
        }
        let message = persisted.existing;
        debug!(
            channel = %channel,
            source_id = %source_id,
            stage = %Stage::Persisted,
            message_id = %message.id,
            "Message stored"
        );

        let matched = self.match_message(&message);
        if matched.is_empty() {
            debug!(channel = %channel, source_id = %source_id, stage = %Stage::Skipped, "No keyword match");
            return Ok(ProcessOutcome::NoMatch);
        }

        let alert = self
            .alerts
            .evaluate(&message, &matched)
            .await
            .map_err(PipelineError::Alert)?;

        Ok(match alert {
            Some(alert) => {
                debug!(
                    channel = %channel,
                    source_id = %source_id,
                    stage = %Stage::Alerted,
                    alert_id = %alert.id,
                    "Alert raised"
                );
                ProcessOutcome::Alerted {
                    alert_id: alert.id,
                    delivered: alert.status == AlertStatus::Delivered,
                }
            }
            // Only reachable when another pass created the alert first.
            None => ProcessOutcome::NoMatch,
        })
    }

    /// Replay of a stored identity: no new row, and an alert only if an
    /// earlier pass stored the message but never got to create one.
    async fn finish_duplicate(
        &self,
        existing: StoredMessage,
    ) -> Result<ProcessOutcome, PipelineError> {
        debug!(
            channel = %existing.channel_id,
            source_id = %existing.source_message_id,
            message_id = %existing.id,
            "Duplicate event, already stored"
        );

        let matched = self.match_message(&existing);
        let recovered = self
            .alerts
            .evaluate(&existing, &matched)
            .await
            .map_err(PipelineError::Alert)?;

        if let Some(alert) = &recovered {
            info!(
                channel = %existing.channel_id,
                source_id = %existing.source_message_id,
                alert_id = %alert.id,
                "Recovered missing alert for replayed message"
            );
        }

        Ok(ProcessOutcome::Duplicate {
            alert_recovered: recovered.is_some(),
        })
    }

    fn match_message(&self, message: &StoredMessage) -> BTreeSet<String> {
        let matched = match_keywords(&message.combined_text, &self.keywords);
        debug!(
            channel = %message.channel_id,
            source_id = %message.source_message_id,
            stage = %Stage::Matched,
            hits = matched.len(),
            "Keywords checked"
        );
        matched
    }

    /// Run a store operation, retrying transient failures with exponential
    /// backoff. Fatal failures return at once.
    async fn with_retry<T, F, Fut>(
        &self,
        stage: Stage,
        channel: &str,
        source_id: &str,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DatabaseError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(source) if source.is_fatal() || attempt >= self.persist_retries => {
                    return Err(PipelineError::Persistence { stage, source });
                }
                Err(e) => {
                    attempt += 1;
                    let delay = PERSIST_RETRY_BASE.saturating_mul(1u32 << (attempt - 1).min(10));
                    warn!(
                        channel = %channel,
                        source_id = %source_id,
                        stage = %stage,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Consume `stream` until it ends, the shutdown grace runs out, or a
    /// worker hits a fatal error.
    ///
    /// Each channel gets a bounded queue and one worker. Once `cancel` fires
    /// the listener is expected to stop and close its stream; events it
    /// already buffered (and confirmed upstream) are still dispatched, and
    /// everything drains for up to `grace`. Workers still busy after that
    /// are aborted. A fatal error cancels `cancel` and is returned.
    pub async fn run(
        self: Arc<Self>,
        mut stream: EventStream,
        cancel: CancellationToken,
        grace: Duration,
    ) -> Result<RunStats, PipelineError> {
        let halt = CancellationToken::new();
        let mut queues: HashMap<String, mpsc::Sender<InboundEvent>> = HashMap::new();
        let mut workers: JoinSet<Result<RunStats, PipelineError>> = JoinSet::new();
        let mut drain_until: Option<Instant> = None;

        info!(queue_capacity = self.queue_capacity, "Pipeline running");

        loop {
            let event = tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                _ = cancel.cancelled(), if drain_until.is_none() => {
                    info!(grace_secs = grace.as_secs(), "Shutdown requested, draining buffered events");
                    drain_until = Some(Instant::now() + grace);
                    continue;
                }
                _ = grace_elapsed(&cancel, drain_until, grace) => {
                    warn!("Shutdown grace period elapsed before the event stream closed");
                    break;
                }
                next = stream.next() => match next {
                    Some(event) => event,
                    None => {
                        info!("Event stream ended");
                        break;
                    }
                },
            };

            let tx = queues.entry(event.channel_id.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.queue_capacity);
                let channel = event.channel_id.clone();
                debug!(channel = %channel, "Starting channel worker");
                workers.spawn(channel_worker(Arc::clone(&self), channel, rx, halt.clone()));
                tx
            });

            let channel = event.channel_id.clone();
            let source_id = event.source_message_id.clone();
            tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                _ = grace_elapsed(&cancel, drain_until, grace) => {
                    warn!(
                        channel = %channel,
                        source_id = %source_id,
                        "Shutdown grace period elapsed, event not dispatched"
                    );
                    break;
                }
                sent = tx.send(event) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        drop(stream);
        drop(queues);

        let mut stats = RunStats::default();
        let mut fatal: Option<PipelineError> = None;

        let remaining = drain_until
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(grace);
        let drained = tokio::time::timeout(remaining, async {
            while let Some(joined) = workers.join_next().await {
                collect_worker(joined, &mut stats, &mut fatal, &halt);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = workers.len(),
                grace_secs = grace.as_secs(),
                "Shutdown grace period elapsed, aborting in-flight events"
            );
            workers.abort_all();
            while let Some(joined) = workers.join_next().await {
                collect_worker(joined, &mut stats, &mut fatal, &halt);
            }
        }

        info!(
            processed = stats.processed,
            alerted = stats.alerted,
            duplicates = stats.duplicates,
            failed = stats.failed,
            "Pipeline stopped"
        );

        match fatal {
            Some(e) => {
                cancel.cancel();
                Err(e)
            }
            None => Ok(stats),
        }
    }
}

/// Resolves once the shutdown grace period has run out. Never resolves
/// before `cancel` fires.
async fn grace_elapsed(cancel: &CancellationToken, drain_until: Option<Instant>, grace: Duration) {
    match drain_until {
        Some(at) => tokio::time::sleep_until(at).await,
        None => {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        }
    }
}

fn collect_worker(
    joined: Result<Result<RunStats, PipelineError>, tokio::task::JoinError>,
    stats: &mut RunStats,
    fatal: &mut Option<PipelineError>,
    halt: &CancellationToken,
) {
    match joined {
        Ok(Ok(worker_stats)) => stats.merge(worker_stats),
        Ok(Err(e)) => {
            halt.cancel();
            fatal.get_or_insert(e);
        }
        Err(join_err) if join_err.is_panic() => {
            halt.cancel();
            fatal.get_or_insert(PipelineError::WorkerStopped {
                channel: "unknown".into(),
                reason: format!("worker panicked: {join_err}"),
            });
        }
        Err(_) => {}
    }
}

/// Drain one channel's queue in order.
async fn channel_worker(
    pipeline: Arc<Pipeline>,
    channel: String,
    mut rx: mpsc::Receiver<InboundEvent>,
    halt: CancellationToken,
) -> Result<RunStats, PipelineError> {
    let mut stats = RunStats::default();

    loop {
        let event = tokio::select! {
            biased;
            _ = halt.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        let source_id = event.source_message_id.clone();
        match pipeline.process(event).await {
            Ok(outcome) => {
                stats.record(&outcome);
                debug!(
                    channel = %channel,
                    source_id = %source_id,
                    stage = %Stage::Done,
                    outcome = outcome.label(),
                    "Event done"
                );
            }
            Err(e) if e.is_fatal() => {
                error!(
                    channel = %channel,
                    source_id = %source_id,
                    error = %e,
                    "Fatal store error, halting pipeline"
                );
                halt.cancel();
                return Err(e);
            }
            Err(e) => {
                // Acknowledged, not requeued.
                stats.failed += 1;
                error!(
                    channel = %channel,
                    source_id = %source_id,
                    error = %e,
                    "Event failed and was dropped"
                );
            }
        }
    }

    debug!(channel = %channel, processed = stats.processed, "Channel worker finished");
    Ok(stats)
}
