//! Configuration types.
//!
//! Built once at startup from environment variables and passed down
//! explicitly; nothing re-reads the environment at runtime.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;
use crate::pipeline::alerts::AlertPolicy;
use crate::pipeline::matcher::KeywordSet;

/// Full monitor configuration.
pub struct MonitorConfig {
    /// Telegram bot token, used for both listening and alerting.
    pub bot_token: SecretString,
    /// Monitored chats: `@username`, numeric chat id, or exact title.
    pub channels: Vec<String>,
    /// Chat that receives alerts.
    pub alert_chat_id: String,
    pub keywords: KeywordSet,
    pub db_path: PathBuf,
    pub ocr: OcrConfig,
    pub alerts: AlertPolicy,
    /// Time between reconciliation sweeps.
    pub reconcile_interval: Duration,
    /// Store retries per event before the event is given up on.
    pub persist_retries: u32,
    /// Per-channel queue depth.
    pub queue_capacity: usize,
    /// How long in-flight events get to finish on shutdown.
    pub shutdown_grace: Duration,
    /// Directory for daily-rolling log files. Stdout only when unset.
    pub log_dir: Option<PathBuf>,
}

/// OCR settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrConfig {
    /// Tesseract language hint, e.g. `por` or `eng+por`.
    pub language: String,
    pub workers: usize,
    pub timeout: Duration,
    pub tesseract_bin: PathBuf,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            language: "por".to_string(),
            workers: 2,
            timeout: Duration::from_secs(30),
            tesseract_bin: PathBuf::from("tesseract"),
        }
    }
}

impl MonitorConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let bot_token = SecretString::from(require("TELEGRAM_BOT_TOKEN")?);

        let channels = split_list(&require("MONITOR_CHANNELS")?);
        if channels.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "MONITOR_CHANNELS".into(),
                hint: "List at least one chat, e.g. MONITOR_CHANNELS=@leaks,-1001234567890".into(),
            });
        }

        let alert_chat_id = require("ALERT_CHAT_ID")?;

        // Present but possibly empty after trimming: a monitor that never alerts.
        let keywords = match lookup("BRAND_KEYWORDS") {
            Some(raw) => KeywordSet::parse(&raw),
            None => return Err(ConfigError::MissingEnvVar("BRAND_KEYWORDS".into())),
        };

        let defaults = OcrConfig::default();
        let ocr = OcrConfig {
            language: get("OCR_LANGUAGE").unwrap_or(defaults.language),
            workers: parse_or(&get, "OCR_WORKERS", defaults.workers)?.max(1),
            timeout: secs_or(&get, "OCR_TIMEOUT_SECS", defaults.timeout)?,
            tesseract_bin: get("TESSERACT_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.tesseract_bin),
        };

        let policy = AlertPolicy::default();
        let alerts = AlertPolicy {
            max_attempts: parse_or(&get, "ALERT_MAX_ATTEMPTS", policy.max_attempts)?.max(1),
            backoff_base: secs_or(&get, "ALERT_BACKOFF_BASE_SECS", policy.backoff_base)?,
            backoff_max: secs_or(&get, "ALERT_BACKOFF_MAX_SECS", policy.backoff_max)?,
            grace: secs_or(&get, "ALERT_GRACE_SECS", policy.grace)?,
        };
        if alerts.backoff_max < alerts.backoff_base {
            return Err(ConfigError::InvalidValue {
                key: "ALERT_BACKOFF_MAX_SECS".into(),
                message: "must be at least ALERT_BACKOFF_BASE_SECS".into(),
            });
        }

        Ok(Self {
            bot_token,
            channels,
            alert_chat_id,
            keywords,
            db_path: get("LEAKWATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/monitor.db")),
            ocr,
            alerts,
            reconcile_interval: secs_or(&get, "RECONCILE_INTERVAL_SECS", Duration::from_secs(60))?
                .max(Duration::from_secs(1)),
            persist_retries: parse_or(&get, "PERSIST_MAX_RETRIES", 5)?,
            queue_capacity: parse_or(&get, "CHANNEL_QUEUE_CAPACITY", 64usize)?.max(1),
            shutdown_grace: secs_or(&get, "SHUTDOWN_GRACE_SECS", Duration::from_secs(10))?,
            log_dir: get("LEAKWATCH_LOG_DIR").map(PathBuf::from),
        })
    }
}

impl fmt::Debug for MonitorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token_state = if self.bot_token.expose_secret().is_empty() {
            "<empty>"
        } else {
            "<redacted>"
        };
        f.debug_struct("MonitorConfig")
            .field("bot_token", &token_state)
            .field("channels", &self.channels)
            .field("alert_chat_id", &self.alert_chat_id)
            .field("keywords", &self.keywords.len())
            .field("db_path", &self.db_path)
            .field("ocr", &self.ocr)
            .field("alerts", &self.alerts)
            .field("reconcile_interval", &self.reconcile_interval)
            .field("persist_retries", &self.persist_retries)
            .field("queue_capacity", &self.queue_capacity)
            .field("shutdown_grace", &self.shutdown_grace)
            .field("log_dir", &self.log_dir)
            .finish()
    }
}

/// Split a comma-delimited list, trimming entries and dropping empties.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}
