//! Chunked Upload Server
//!
//! Accepts large files as independently uploaded chunks, reassembles them
//! into storage and hands each stored file to the encoding job pipeline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunked_upload_server::config::{Config, JobsConfig};
use chunked_upload_server::jobs::{EncodingJobService, JobNotifier, LogJobNotifier, WebhookPublisher};
use chunked_upload_server::state::AppState;
use chunked_upload_server::upload::{ChunkStore, SessionManager, SessionReaper};
use chunked_upload_server::{db, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "chunked_upload_server=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Chunked Upload Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Staging directory: {}", config.upload.temp_dir.display());
    tracing::info!("Storage directory: {}", config.upload.storage_dir.display());
    tracing::info!("Chunk size: {} bytes", config.upload.chunk_size);

    config
        .upload
        .ensure_directories()
        .await
        .context("Failed to create upload directories")?;

    let notifier = build_notifier(&config.jobs).await?;

    let chunk_store = ChunkStore::new(&config.upload.temp_dir, &config.upload.storage_dir);
    let sessions = SessionManager::new(chunk_store, notifier, config.upload.session_settings());

    let reaper = SessionReaper::new(sessions.clone(), config.upload.reaper_interval()).spawn();

    let app_state = AppState::new(sessions);
    let app = routes::app(app_state);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    tracing::info!("Chunked Upload Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    reaper.abort();
    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Pick the job notifier: SQLite job records when a database is configured,
/// log-only otherwise.
async fn build_notifier(config: &JobsConfig) -> anyhow::Result<Arc<dyn JobNotifier>> {
    let Some(url) = &config.database_url else {
        tracing::info!("No DATABASE_URL set, completed uploads are only logged");
        return Ok(Arc::new(LogJobNotifier));
    };

    let pool = db::create_pool(url)
        .await
        .context("Failed to initialize job database")?;
    tracing::info!("Job database initialized at {}", url);

    let publisher = match &config.webhook_url {
        Some(webhook_url) => {
            let publisher = WebhookPublisher::new(
                webhook_url,
                Duration::from_secs(config.webhook_timeout_secs),
            )
            .context("Failed to create job webhook publisher")?;
            tracing::info!("Publishing encoding jobs to {}", publisher.url());
            Some(publisher)
        }
        None => None,
    };

    Ok(Arc::new(EncodingJobService::new(pool, publisher)))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
