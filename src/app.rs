use crate::config::{Config, Credentials, LogLimits, ProviderKind};
use crate::routes;
use crate::systemd::ServiceRegistry;
use crate::systemd::client::SystemdClient;
use crate::systemd::journal::{CliProvider, Journal, JournalProvider, NativeProvider};
use anyhow::{Context, Result};
use axum::Router;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a request handler may touch; cheap to clone
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn ServiceRegistry>,
    pub journal: Arc<Journal>,
    pub limits: LogLimits,
    pub credentials: Option<Arc<Credentials>>,
}

/// Owns the systemd connection and journal for the life of the process
pub struct App {
    systemd: SystemdClient,
    state: AppState,
    shutdown: CancellationToken,
}

impl App {
    pub async fn new(config: &Config, shutdown: CancellationToken) -> Result<Self> {
        config.validate()?;

        let systemd = SystemdClient::connect(&config.bus())
            .await
            .context("failed to connect to the systemd D-Bus")?;

        let providers: Vec<Arc<dyn JournalProvider>> = config
            .journal_providers
            .iter()
            .map(|kind| -> Arc<dyn JournalProvider> {
                match kind {
                    ProviderKind::Native => {
                        Arc::new(NativeProvider::new(config.journal_dir.clone()))
                    }
                    ProviderKind::Cli => Arc::new(CliProvider::new(
                        config.journalctl.clone(),
                        config.journal_dir.clone(),
                    )),
                }
            })
            .collect();
        let journal = Journal::new(providers, config.call_timeout(), shutdown.clone());
        tracing::info!(
            providers = ?journal.provider_names(),
            user_mode = systemd.is_user_mode(),
            "journal and service manager ready"
        );

        let credentials = config.credentials()?;
        if credentials.is_none() {
            tracing::warn!("AUTH_USERNAME/AUTH_PASSWORD not set, API is unauthenticated");
        }

        let state = AppState {
            registry: Arc::new(systemd.clone()),
            journal: Arc::new(journal),
            limits: config.log_limits()?,
            credentials: credentials.map(Arc::new),
        };

        Ok(Self {
            systemd,
            state,
            shutdown,
        })
    }

    pub fn router(&self) -> Router {
        routes::router(self.state.clone())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Tear down the bus connection after the server has stopped
    pub async fn close(self) {
        self.shutdown.cancel();
        drop(self.state);
        self.systemd.close().await;
        tracing::info!("D-Bus connection closed");
    }
}
