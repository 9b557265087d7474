//! obs-websocket proxy that passes every frame through unchanged and
//! answers the synthetic `__GetTextFromLastScreenshot` request itself,
//! running text recognition over the last `GetSourceScreenshot` response
//! it saw on the same connection.

pub mod config;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod upstream;

use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

use crate::{
    config::ServerConfig,
    router::{router, AppState},
    session::SessionSettings,
};

pub async fn run(config: ServerConfig, metrics: Option<PrometheusHandle>) -> Result<()> {
    let settings = SessionSettings::from_config(&config);
    info!(
        recognizer = settings.recognizer.name(),
        recognition_timeout_secs = config.recognition_timeout.map(|limit| limit.as_secs()),
        max_frame_bytes = config.upstream.max_frame_bytes,
        "session settings"
    );
    let state = Arc::new(AppState::new(settings, metrics));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("obs-ocr proxy listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; waiting for sessions to wind down"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
