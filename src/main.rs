use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use invoice_agent::api::{AppState, api_routes};
use invoice_agent::config::{AppConfig, LogConfig};
use invoice_agent::extract::DocumentTextExtractor;
use invoice_agent::llm::create_provider;
use invoice_agent::mailbox::{ImapMailbox, Mailbox};
use invoice_agent::pipeline::{
    DocumentClassifier, LlmClassifier, Pipeline, PipelineDriver, spawn_mailbox_monitor,
};
use invoice_agent::storage::StorageService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let config = AppConfig::from_env().context("Invalid configuration")?;
    let _log_guard = init_logging(&config.logging)?;

    eprintln!("📄 Invoice Agent v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.llm.model);
    eprintln!("   Storage: {}", config.storage.base_path.display());
    eprintln!("   API: http://{}", config.api.bind_addr());

    // ── Collaborators ───────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let extractor = Arc::new(DocumentTextExtractor::with_timeout(config.extract_timeout));
    let classifier: Arc<dyn DocumentClassifier> = Arc::new(LlmClassifier::new(llm, extractor));
    let storage = Arc::new(StorageService::new(config.storage.clone()).await?);

    let mailbox: Option<Arc<dyn Mailbox>> = match &config.mailbox {
        Some(imap) => {
            eprintln!("   Mailbox: {}@{}/{}", imap.username, imap.host, imap.folder);
            Some(Arc::new(ImapMailbox::new(imap.clone())))
        }
        None => {
            eprintln!("   Mailbox: disabled (EMAIL_IMAP_HOST not set)");
            None
        }
    };

    // ── Pipeline ────────────────────────────────────────────────────────
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&storage),
        Arc::clone(&classifier),
        mailbox.clone(),
    ));
    let driver = Arc::new(PipelineDriver::new(
        pipeline,
        mailbox.clone(),
        config.monitor.max_concurrent_runs,
    ));
    let driver_shutdown = driver.shutdown_flag();

    let monitor = if mailbox.is_some() && !config.monitor.check_interval.is_zero() {
        Some(spawn_mailbox_monitor(
            Arc::clone(&driver),
            config.monitor.clone(),
        ))
    } else {
        None
    };

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = api_routes(AppState {
        driver,
        storage,
        classifier,
    });
    let listener = tokio::net::TcpListener::bind(config.api.bind_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.api.bind_addr()))?;
    tracing::info!(addr = %config.api.bind_addr(), "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            driver_shutdown.store(true, Ordering::SeqCst);
        })
        .await?;

    if let Some((handle, shutdown)) = monitor {
        shutdown.store(true, Ordering::Relaxed);
        // Runs are spawned tasks and keep going after the monitor is aborted.
        handle.abort();
        let _ = handle.await;
    }

    tracing::info!("Invoice agent stopped");
    Ok(())
}

/// Console plus daily-rolling file output. The returned guard flushes the
/// file writer on drop and must live until exit.
fn init_logging(config: &LogConfig) -> anyhow::Result<WorkerGuard> {
    let directory = config
        .file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = config
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "app.log".to_string());

    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(directory, prefix));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("Failed to initialise logging")?;

    Ok(guard)
}
