use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod cors;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use handlers::content_handlers::AppState;
use services::{
    accounting::AccountingReporter, background::BackgroundTasks,
    content_fetcher::ContentFetcher, response_cache::MemoryResponseCache,
    storage_service::StorageService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting cdn-edge with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    let db_path = Path::new(
        db_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("file:"),
    );
    tracing::debug!("Interpreted SQLite path => {}", db_path.display());

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // Migrations may run against a fresh file; serving never creates one.
    if migrate {
        if let Err(e) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path)
        {
            tracing::warn!("Failed to open {} manually: {}", db_path.display(), e);
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );

    let storage = StorageService::new(db, cfg.storage_dir.clone(), cfg.bucket.clone());

    // --- Handle migration mode ---
    if migrate {
        let count = storage.migrate().await?;
        tracing::info!("Database migration complete ({} statements).", count);
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let tasks = BackgroundTasks::new();
    let fetcher = ContentFetcher::new(
        Arc::new(storage),
        Arc::new(MemoryResponseCache::new(cfg.cache_capacity)),
        tasks.clone(),
        cfg.max_cacheable_bytes,
    );
    let accounting = AccountingReporter::new(&cfg.accounting, tasks.clone())?;

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(AppState {
        fetcher,
        accounting,
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Let cache fills and download counts finish ---
    tracing::info!(
        pending = tasks.pending(),
        "Draining background tasks (up to {:?})",
        cfg.drain_timeout
    );
    if tasks.shutdown(cfg.drain_timeout).await {
        tracing::info!("Background tasks drained.");
    }

    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
