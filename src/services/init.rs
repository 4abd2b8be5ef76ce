//! Startup helpers for the binary:
//! - database connection + migrations
//! - background worker spawn helpers

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::services::dedup::Deduplicator;
use crate::services::retry::RetryManager;

/// Strip credentials from a database URL before logging it.
pub fn redact_db_url(db_url: &str) -> String {
    if let Ok(url) = url::Url::parse(db_url) {
        let host = url.host_str().unwrap_or("");
        let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        format!("{}://{}{}{}", url.scheme(), host, port, url.path())
    } else if let Some(at) = db_url.find('@') {
        format!("(redacted){}", &db_url[at + 1..])
    } else {
        "(redacted)".to_string()
    }
}

/// Open the SQLite pool (creating the file and its directory if needed) and
/// apply migrations.
pub async fn init_db(config: &Config) -> Result<SqlitePool> {
    let db_url = &config.database.url;
    tracing::info!("Connecting to database: {}", redact_db_url(db_url));

    let db_path = db_url.strip_prefix("sqlite://").unwrap_or(db_url);
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                )
            })?;
        }
    }

    let connect_options = sqlx::sqlite::SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(connect_options)
        .await?;

    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Spawn the periodic workers:
/// - delivery/retry polling (only when `retry` is given)
/// - expired fingerprint sweep
///
/// Each worker exits when `shutdown` fires; await the returned handles to
/// wait for them.
pub fn spawn_background_workers(
    pool: SqlitePool,
    config: &Config,
    retry: Option<Arc<RetryManager>>,
    shutdown: broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    if let Some(manager) = retry {
        let mut shutdown_rx = shutdown.subscribe();
        let poll_interval = Duration::from_secs(manager.config().poll_interval_seconds);
        let batch_size = manager.config().batch_size as usize;
        handles.push(tokio::spawn(async move {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    tracing::info!("Delivery worker received shutdown signal");
                    break;
                }

                if let Err(e) = manager.release_stale_claims().await {
                    tracing::warn!("Failed to release stale claims: {}", e);
                }

                let drained = match manager.process_due().await {
                    Ok(summary) => summary.claimed < batch_size,
                    Err(e) => {
                        tracing::warn!("Failed to fetch due notifications: {}", e);
                        true
                    }
                };

                // A full batch means more may be due; poll again right away.
                if !drained {
                    continue;
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Delivery worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }));
    }

    {
        let mut shutdown_rx = shutdown.subscribe();
        let dedup = Deduplicator::new(pool, config.dedup.clone());
        let interval = Duration::from_secs(config.dedup.sweep_interval_seconds.max(1));
        handles.push(tokio::spawn(async move {
            loop {
                match dedup.cleanup_expired().await {
                    Ok(0) => tracing::debug!("No expired fingerprints to sweep"),
                    Ok(n) => tracing::info!("Swept {} expired fingerprint(s)", n),
                    Err(e) => tracing::warn!("Fingerprint sweep failed: {}", e),
                }

                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Fingerprint sweep worker shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    handles
}
