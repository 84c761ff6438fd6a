pub mod client;
pub mod journal;
pub mod logs;

use async_trait::async_trait;
use client::{SystemdError, UnitAction, UnitInfo};

/// The service manager as the HTTP layer sees it
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// All `.service` units, sorted by name, fetched fresh on every call
    async fn list_services(&self) -> Result<Vec<UnitInfo>, SystemdError>;

    /// Queue a single start/stop/restart job; never retried
    async fn control(&self, action: UnitAction, name: &str) -> Result<(), SystemdError>;

    async fn start(&self, name: &str) -> Result<(), SystemdError> {
        self.control(UnitAction::Start, name).await
    }

    async fn stop(&self, name: &str) -> Result<(), SystemdError> {
        self.control(UnitAction::Stop, name).await
    }

    async fn restart(&self, name: &str) -> Result<(), SystemdError> {
        self.control(UnitAction::Restart, name).await
    }
}

/// Canonicalize a unit name from a URL: `nginx` becomes `nginx.service`.
///
/// Returns `None` for names systemd could never accept.
pub fn canonical_unit_name(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name.len() > 255 || name.contains('/') || name.chars().any(char::is_control)
    {
        return None;
    }
    if name.contains('.') && !name.ends_with('.') {
        Some(name.to_string())
    } else {
        Some(format!("{}.service", name.trim_end_matches('.')))
    }
}
