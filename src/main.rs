use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use secrecy::{ExposeSecret, SecretString};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use leakwatch::channels::{Listener, TelegramListener, TelegramNotifier};
use leakwatch::config::MonitorConfig;
use leakwatch::ocr::{OcrPool, TesseractCli};
use leakwatch::pipeline::{AlertEngine, Extractor, Pipeline, spawn_reconciler};
use leakwatch::shutdown::install_signal_handler;
use leakwatch::store::{Database, LibSqlBackend};

#[tokio::main]
async fn main() -> ExitCode {
    let config = match MonitorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("  Required: TELEGRAM_BOT_TOKEN, MONITOR_CHANNELS, ALERT_CHAT_ID, BRAND_KEYWORDS");
            return ExitCode::FAILURE;
        }
    };

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("🔎 Leakwatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Channels: {}", config.channels.join(", "));
    eprintln!("   Keywords: {}", config.keywords.len());
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   OCR: {} ({} workers)", config.ocr.language, config.ocr.workers);

    match run(config).await {
        Ok(()) => {
            tracing::info!("Leakwatch stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Leakwatch stopped on a fatal error");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Stdout logging with `EnvFilter`, plus a daily-rolling file when
/// `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout = fmt::layer().with_target(false);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "leakwatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout).init();
            None
        }
    }
}

async fn run(config: MonitorConfig) -> anyhow::Result<()> {
    let MonitorConfig {
        bot_token,
        channels,
        alert_chat_id,
        keywords,
        db_path,
        ocr,
        alerts,
        reconcile_interval,
        persist_retries,
        queue_capacity,
        shutdown_grace,
        ..
    } = config;

    if keywords.is_empty() {
        tracing::warn!("BRAND_KEYWORDS is empty; messages will be stored but never alert");
    }

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?,
    );

    // ── Telegram ─────────────────────────────────────────────────────────
    let listener = TelegramListener::new(
        SecretString::from(bot_token.expose_secret().to_string()),
        channels,
    );
    listener
        .health_check()
        .await
        .context("Telegram credential check failed")?;
    let notifier = Arc::new(TelegramNotifier::new(bot_token, alert_chat_id));

    // ── Pipeline ─────────────────────────────────────────────────────────
    let ocr_pool = OcrPool::new(
        Arc::new(TesseractCli::new(ocr.tesseract_bin)),
        ocr.workers,
        ocr.language,
        ocr.timeout,
    );
    let alert_engine = Arc::new(AlertEngine::new(Arc::clone(&db), notifier, alerts));

    let cancel = install_signal_handler();

    // Resumes alerts left pending by a previous run.
    let reconciler = spawn_reconciler(
        Arc::clone(&alert_engine),
        reconcile_interval,
        cancel.clone(),
    );

    let pipeline = Arc::new(
        Pipeline::new(
            Extractor::new(ocr_pool.clone()),
            Arc::clone(&db),
            Arc::new(keywords),
            alert_engine,
        )
        .with_persist_retries(persist_retries)
        .with_queue_capacity(queue_capacity),
    );

    let stream = listener
        .start(cancel.clone())
        .await
        .context("Failed to start Telegram listener")?;
    tracing::info!("Monitoring started");

    let result = pipeline.run(stream, cancel.clone(), shutdown_grace).await;
    let stream_lost = result.is_ok() && !cancel.is_cancelled();

    cancel.cancel();
    ocr_pool.close();
    if let Err(e) = reconciler.await {
        tracing::warn!(error = %e, "Reconciler task did not stop cleanly");
    }

    let stats = result.context("Pipeline halted")?;
    tracing::info!(
        processed = stats.processed,
        alerted = stats.alerted,
        duplicates = stats.duplicates,
        failed = stats.failed,
        "Run summary"
    );

    if stream_lost {
        anyhow::bail!("Telegram listener stopped unexpectedly");
    }
    Ok(())
}
