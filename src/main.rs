use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use proxy_metrics::config::AppConfig;
use proxy_metrics::workers::Workers;
use proxy_metrics::{server, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,proxy_metrics=debug")),
        )
        .init();

    // ── 1. Load configuration ────────────────────────────────────
    let config_path = AppConfig::default_path();
    let config = AppConfig::load(&config_path)?;
    let addr = config.server.http_addr.clone();
    tracing::info!(
        config = %config_path.display(),
        storage_enabled = config.metrics_storage.enabled,
        db_path = %config.metrics_storage.db_path,
        "configuration loaded"
    );

    // ── 2. Build shared state & start workers ────────────────────
    let (state, queues) = AppState::new(config);
    let workers = Workers::spawn(state.clone(), queues);

    // ── 3. Build Axum router ─────────────────────────────────────
    let app = server::create_router(state.clone());

    // ── 4. Bind & serve ──────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "proxy-metrics listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .context("server exited with error")?;

    // ── 5. Drain queues and flush open buckets ───────────────────
    workers.shutdown().await;
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
    state.begin_shutdown();
}
