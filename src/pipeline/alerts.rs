//! Alert engine — creates at most one alert per message and drives delivery.
//!
//! Delivery is attempted immediately on creation. Failures leave the alert
//! pending with a scheduled `next_attempt_at`; the reconciler picks those up
//! until the alert is delivered or runs out of attempts and is marked failed.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::{AlertNotice, Notifier};
use crate::error::{DatabaseError, DeliveryError};
use crate::store::{Alert, AlertStatus, Database, StoredMessage};

/// Pending alerts handled per reconciliation sweep.
const SWEEP_BATCH: usize = 100;

/// How long a delivery attempt holds an alert before the reconciler may
/// take it over. Longer than the notifier's own request timeouts.
pub const DELIVERY_LEASE: Duration = Duration::from_secs(300);

fn lease_until(now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
    now + chrono::Duration::from_std(DELIVERY_LEASE).unwrap_or_else(|_| chrono::Duration::minutes(5))
}

/// Retry policy for alert delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertPolicy {
    /// Total delivery attempts, the immediate one included.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Age a pending alert must reach before the reconciler touches it.
    pub grace: Duration,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(600),
            grace: Duration::from_secs(30),
        }
    }
}

impl AlertPolicy {
    /// Delay before the next attempt after `attempts` failures, without jitter.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    /// `backoff_delay` plus up to 10% random jitter.
    pub fn jittered_delay(&self, attempts: u32) -> Duration {
        let delay = self.backoff_delay(attempts);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..=0.1);
        delay + delay.mul_f64(jitter)
    }
}

/// Result of a reconciliation sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub delivered: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

/// Creates alerts and delivers them through a `Notifier`.
pub struct AlertEngine {
    db: Arc<dyn Database>,
    notifier: Arc<dyn Notifier>,
    policy: AlertPolicy,
}

impl AlertEngine {
    pub fn new(db: Arc<dyn Database>, notifier: Arc<dyn Notifier>, policy: AlertPolicy) -> Self {
        Self {
            db,
            notifier,
            policy,
        }
    }

    /// Create and deliver an alert for `message` if anything matched.
    ///
    /// Returns `None` when nothing matched or the message already has an
    /// alert. The returned alert reflects the outcome of the immediate
    /// delivery attempt. Delivery failures never surface as errors here.
    pub async fn evaluate(
        &self,
        message: &StoredMessage,
        matched_keywords: &BTreeSet<String>,
    ) -> Result<Option<Alert>, DatabaseError> {
        if matched_keywords.is_empty() {
            return Ok(None);
        }

        if self.db.get_alert_for_message(message.id).await?.is_some() {
            debug!(
                channel = %message.channel_id,
                source_id = %message.source_message_id,
                "Alert already exists, skipping"
            );
            return Ok(None);
        }

        // Created already leased, so a sweep cannot race the immediate attempt.
        let mut fresh = Alert::new(message.id, matched_keywords.clone());
        fresh.next_attempt_at = Some(lease_until(fresh.created_at));
        let Some(alert) = self.db.create_alert(&fresh).await? else {
            return Ok(None);
        };

        warn!(
            channel = %message.channel_id,
            source_id = %message.source_message_id,
            alert_id = %alert.id,
            keywords = %alert.matched_keywords.iter().cloned().collect::<Vec<_>>().join(", "),
            "Keyword hit, alert created"
        );

        self.attempt_delivery(alert, message).await.map(Some)
    }

    /// One delivery attempt for a pending alert. Records the outcome.
    pub async fn attempt_delivery(
        &self,
        mut alert: Alert,
        message: &StoredMessage,
    ) -> Result<Alert, DatabaseError> {
        let notice = AlertNotice::new(&alert, message);
        let attempt = alert.delivery_attempts + 1;

        match self.notifier.deliver(&notice).await {
            Ok(()) => {
                let now = Utc::now();
                self.db.mark_alert_delivered(alert.id, now).await?;
                info!(
                    alert_id = %alert.id,
                    attempt,
                    notifier = self.notifier.name(),
                    "Alert delivered"
                );
                alert.status = AlertStatus::Delivered;
                alert.notified_at = Some(now);
                alert.delivery_attempts = attempt;
                alert.next_attempt_at = None;
            }
            Err(e) => {
                self.record_failure(&mut alert, &e).await?;
            }
        }

        Ok(alert)
    }

    async fn record_failure(
        &self,
        alert: &mut Alert,
        error: &DeliveryError,
    ) -> Result<(), DatabaseError> {
        let reason = error.to_string();
        let delay = self.policy.jittered_delay(alert.delivery_attempts + 1);
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));

        let attempts = self
            .db
            .record_delivery_failure(alert.id, &reason, next_attempt_at)
            .await?;
        alert.delivery_attempts = attempts;
        alert.last_error = Some(reason.clone());

        let exhausted = attempts >= self.policy.max_attempts
            || matches!(error, DeliveryError::MissingMessage(_));
        if exhausted {
            self.db.mark_alert_failed(alert.id, &reason).await?;
            alert.status = AlertStatus::Failed;
            alert.next_attempt_at = None;
            error!(
                alert_id = %alert.id,
                message_id = %alert.message_id,
                attempt = attempts,
                error = %reason,
                "Alert delivery permanently failed, needs manual follow-up"
            );
        } else {
            alert.next_attempt_at = Some(next_attempt_at);
            warn!(
                alert_id = %alert.id,
                attempt = attempts,
                retry_in_secs = delay.as_secs(),
                error = %reason,
                "Alert delivery failed, will retry"
            );
        }
        Ok(())
    }

    /// Retry every due pending alert once.
    pub async fn sweep_once(&self) -> Result<SweepStats, DatabaseError> {
        let now = Utc::now();
        let grace = chrono::Duration::from_std(self.policy.grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let due = self
            .db
            .due_pending_alerts(now, now - grace, SWEEP_BATCH)
            .await?;

        let mut stats = SweepStats::default();
        for alert in due {
            let claimed_at = Utc::now();
            if !self
                .db
                .claim_alert(alert.id, claimed_at, lease_until(claimed_at))
                .await?
            {
                debug!(alert_id = %alert.id, "Alert delivery already in flight, skipping");
                continue;
            }
            let outcome = match self.db.get_message(alert.message_id).await? {
                Some(message) => self.attempt_delivery(alert, &message).await?,
                None => {
                    let mut alert = alert;
                    let missing = DeliveryError::MissingMessage(alert.message_id.to_string());
                    self.record_failure(&mut alert, &missing).await?;
                    alert
                }
            };
            match outcome.status {
                AlertStatus::Delivered => stats.delivered += 1,
                AlertStatus::Failed => stats.failed += 1,
                AlertStatus::Pending => stats.rescheduled += 1,
            }
        }

        if stats != SweepStats::default() {
            info!(
                delivered = stats.delivered,
                rescheduled = stats.rescheduled,
                failed = stats.failed,
                "Reconciliation sweep finished"
            );
        }
        Ok(stats)
    }
}

/// Spawn the background reconciler: one sweep now, then one per `interval`,
/// until `cancel` fires. Sweep errors are logged and the loop continues.
pub fn spawn_reconciler(
    engine: Arc<AlertEngine>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Reconciler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = engine.sweep_once().await {
                        error!(error = %e, "Reconciliation sweep failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::pipeline::types::{ExtractedText, InboundEvent};
    use crate::store::LibSqlBackend;

    /// Records notices; fails the first `fail_first` calls.
    struct RecordingNotifier {
        fail_first: usize,
        calls: AtomicUsize,
        delivered: Mutex<Vec<AlertNotice>>,
    }

    impl RecordingNotifier {
        fn new(fail_first: usize) -> Self {
            Self {
                fail_first,
                calls: AtomicUsize::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }

        fn delivered(&self) -> Vec<AlertNotice> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &str {
            "recording"
        }

        async fn deliver(&self, notice: &AlertNotice) -> Result<(), DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(DeliveryError::Transport {
                    notifier: "recording".into(),
                    reason: "network down".into(),
                });
            }
            self.delivered.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    /// Succeeds after `delay`, counting calls.
    struct SlowNotifier {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for SlowNotifier {
        fn name(&self) -> &str {
            "slow"
        }

        async fn deliver(&self, _notice: &AlertNotice) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    fn instant_policy(max_attempts: u32) -> AlertPolicy {
        AlertPolicy {
            max_attempts,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            grace: Duration::ZERO,
        }
    }

    fn keywords(words: &[&str]) -> BTreeSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    async fn setup(
        notifier: Arc<RecordingNotifier>,
        policy: AlertPolicy,
    ) -> (Arc<dyn Database>, AlertEngine, StoredMessage) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let event = InboundEvent::text("@chanA", "42", "buy now at brand1.shop");
        let message = StoredMessage::from_event(
            &event,
            ExtractedText::new("buy now at brand1.shop", ""),
        );
        db.persist_message(&message).await.unwrap();
        let engine = AlertEngine::new(Arc::clone(&db), notifier, policy);
        (db, engine, message)
    }

    // ── Backoff ─────────────────────────────────────────────────────

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = AlertPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(120));
        assert_eq!(policy.backoff_delay(6), Duration::from_secs(600));
        assert_eq!(policy.backoff_delay(1000), Duration::from_secs(600));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = AlertPolicy::default();
        for _ in 0..50 {
            let d = policy.jittered_delay(2);
            assert!(d >= Duration::from_secs(60));
            assert!(d <= Duration::from_secs(66));
        }
    }

    // ── Evaluate ────────────────────────────────────────────────────

    #[tokio::test]
    async fn no_match_no_alert() {
        let notifier = Arc::new(RecordingNotifier::new(0));
        let (db, engine, message) = setup(notifier.clone(), instant_policy(3)).await;

        let result = engine.evaluate(&message, &BTreeSet::new()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(db.count_alerts(None).await.unwrap(), 0);
        assert!(notifier.delivered().is_empty());
    }

    #[tokio::test]
    async fn match_creates_and_delivers() {
        let notifier = Arc::new(RecordingNotifier::new(0));
        let (db, engine, message) = setup(notifier.clone(), instant_policy(3)).await;

        let alert = engine
            .evaluate(&message, &keywords(&["brand1"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.status, AlertStatus::Delivered);
        assert!(alert.notified_at.is_some());

        let stored = db.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Delivered);
        assert_eq!(stored.delivery_attempts, 1);

        let sent = notifier.delivered();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_id, "@chanA");
        assert_eq!(sent[0].matched_keywords, vec!["brand1".to_string()]);
    }

    #[tokio::test]
    async fn second_evaluate_is_noop() {
        let notifier = Arc::new(RecordingNotifier::new(0));
        let (db, engine, message) = setup(notifier.clone(), instant_policy(3)).await;

        engine.evaluate(&message, &keywords(&["brand1"])).await.unwrap();
        let again = engine.evaluate(&message, &keywords(&["brand1"])).await.unwrap();
        assert!(again.is_none());
        assert_eq!(db.count_alerts(None).await.unwrap(), 1);
        assert_eq!(notifier.delivered().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_stays_pending_then_reconciles() {
        let notifier = Arc::new(RecordingNotifier::new(1));
        let (db, engine, message) = setup(notifier.clone(), instant_policy(3)).await;

        let alert = engine
            .evaluate(&message, &keywords(&["brand1"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.status, AlertStatus::Pending);
        assert_eq!(alert.delivery_attempts, 1);
        assert_eq!(alert.last_error.as_deref().map(|e| e.contains("network down")), Some(true));

        let stats = engine.sweep_once().await.unwrap();
        assert_eq!(stats.delivered, 1);

        let stored = db.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Delivered);
        assert_eq!(stored.delivery_attempts, 2);
        assert_eq!(notifier.delivered().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_mark_failed() {
        let notifier = Arc::new(RecordingNotifier::new(usize::MAX));
        let (db, engine, message) = setup(notifier.clone(), instant_policy(3)).await;

        let alert = engine
            .evaluate(&message, &keywords(&["brand1"]))
            .await
            .unwrap()
            .unwrap();

        let first = engine.sweep_once().await.unwrap();
        assert_eq!(first.rescheduled, 1);
        let second = engine.sweep_once().await.unwrap();
        assert_eq!(second.failed, 1);

        let stored = db.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Failed);
        assert_eq!(stored.delivery_attempts, 3);

        // Failed alerts are never retried again.
        let third = engine.sweep_once().await.unwrap();
        assert_eq!(third, SweepStats::default());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sweep_respects_grace_period() {
        let notifier = Arc::new(RecordingNotifier::new(1));
        let policy = AlertPolicy {
            grace: Duration::from_secs(3600),
            ..instant_policy(3)
        };
        let (_db, engine, message) = setup(notifier.clone(), policy).await;

        engine.evaluate(&message, &keywords(&["brand1"])).await.unwrap();
        let stats = engine.sweep_once().await.unwrap();
        assert_eq!(stats, SweepStats::default());
    }

    #[tokio::test]
    async fn sweep_waits_for_backoff() {
        let notifier = Arc::new(RecordingNotifier::new(1));
        let policy = AlertPolicy {
            backoff_base: Duration::from_secs(3600),
            backoff_max: Duration::from_secs(3600),
            ..instant_policy(3)
        };
        let (_db, engine, message) = setup(notifier.clone(), policy).await;

        engine.evaluate(&message, &keywords(&["brand1"])).await.unwrap();
        let stats = engine.sweep_once().await.unwrap();
        assert_eq!(stats, SweepStats::default());
    }

    #[tokio::test]
    async fn sweep_skips_alert_with_delivery_in_flight() {
        let notifier = Arc::new(SlowNotifier {
            delay: Duration::from_millis(300),
            calls: AtomicUsize::new(0),
        });
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let event = InboundEvent::text("@chanA", "42", "brand1 dump");
        let message = StoredMessage::from_event(&event, ExtractedText::new("brand1 dump", ""));
        db.persist_message(&message).await.unwrap();
        let policy = AlertPolicy {
            grace: Duration::from_millis(50),
            ..instant_policy(3)
        };
        let engine = Arc::new(AlertEngine::new(Arc::clone(&db), notifier.clone(), policy));

        let first = {
            let engine = Arc::clone(&engine);
            let message = message.clone();
            tokio::spawn(async move { engine.evaluate(&message, &keywords(&["brand1"])).await })
        };

        // Alert exists and is past grace while the first attempt is still sending.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let stats = engine.sweep_once().await.unwrap();
        assert_eq!(stats, SweepStats::default());

        let alert = first.await.unwrap().unwrap().unwrap();
        assert_eq!(alert.status, AlertStatus::Delivered);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);

        let stored = db.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.delivery_attempts, 1);
        assert!(stored.next_attempt_at.is_none());
    }

    #[tokio::test]
    async fn spawned_reconciler_delivers_and_stops() {
        let notifier = Arc::new(RecordingNotifier::new(1));
        let (db, engine, message) = setup(notifier.clone(), instant_policy(3)).await;
        let engine = Arc::new(engine);

        let alert = engine
            .evaluate(&message, &keywords(&["brand1"]))
            .await
            .unwrap()
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = spawn_reconciler(Arc::clone(&engine), Duration::from_millis(10), cancel.clone());

        for _ in 0..100 {
            let stored = db.get_alert(alert.id).await.unwrap().unwrap();
            if stored.status == AlertStatus::Delivered {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let stored = db.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Delivered);
    }
}
