use anyhow::{Context, Result};
use clap::Parser;
use libsystemd::daemon::{self, NotifyState};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod app;
mod auth;
mod config;
mod error;
mod routes;
mod systemd;

use app::App;
use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let shutdown = CancellationToken::new();

    // Create app (async - connects to systemd)
    let app = match App::new(&config, shutdown.clone()).await {
        Ok(app) => app,
        Err(e) => {
            tracing::error!("Failed to initialize: {:#}", e);
            return Err(e);
        }
    };

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(listen = %config.listen, "sysdash listening");
    notify(&[NotifyState::Ready]);

    tokio::spawn(wait_for_signal(app.shutdown_token()));

    let token = app.shutdown_token();
    let result = axum::serve(listener, app.router())
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("HTTP server failed");

    notify(&[NotifyState::Stopping]);
    app.close().await;

    result
}

/// Cancel the token on SIGINT or SIGTERM
async fn wait_for_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down"),
        _ = term.recv() => tracing::info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}

/// Tell systemd about our state when it supervises us; no-op otherwise
fn notify(state: &[NotifyState]) {
    match daemon::notify(false, state) {
        Ok(true) => tracing::debug!("sd_notify sent"),
        Ok(false) => {}
        Err(e) => tracing::warn!("sd_notify failed: {}", e),
    }
}
