use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use notification_scheduler::config::Config;
use notification_scheduler::services::delivery::WebhookDeliveryChannel;
use notification_scheduler::services::init;
use notification_scheduler::services::retry::RetryManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // LOG_FORMAT=json switches to structured output.
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notification_scheduler=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .init();

    let config = Config::from_env()?;

    tracing::info!("Starting notification scheduler");

    let pool = init::init_db(&config).await?;

    let retry = match (&config.delivery.webhook_url, config.retry.enabled) {
        (Some(url), true) => {
            let channel = WebhookDeliveryChannel::new(
                url,
                Duration::from_secs(config.delivery.timeout_seconds),
            )?;
            tracing::info!("Delivery worker enabled");
            Some(Arc::new(RetryManager::new(
                pool.clone(),
                Arc::new(channel),
                config.retry.clone(),
            )))
        }
        (None, true) => {
            tracing::warn!("DELIVERY_WEBHOOK_URL is not set; delivery worker not started");
            None
        }
        (_, false) => {
            tracing::info!("Delivery worker disabled by NOTIFICATION_RETRY_ENABLED");
            None
        }
    };

    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let bg_handles =
        init::spawn_background_workers(pool.clone(), &config, retry, shutdown_tx.clone());

    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = ctrl_c => res?,
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
    }

    tracing::info!("Shutdown signal received, notifying background workers");
    let _ = shutdown_tx.send(());

    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );
    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    if tokio::time::timeout(shutdown_wait, bg_wait).await.is_err() {
        tracing::warn!("Background workers did not exit in time");
    }

    pool.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
