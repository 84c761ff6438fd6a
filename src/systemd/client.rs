use crate::systemd::ServiceRegistry;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::process::Command;
use zbus::{Connection, proxy};

/// Detect if running as root
pub fn is_root() -> bool {
    unsafe { libc::getuid() == 0 }
}

/// Systemd Manager D-Bus proxy
#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    /// List all units
    /// Returns: [(name, description, load_state, active_state, sub_state,
    ///           follower, object_path, job_id, job_type, job_object_path)]
    fn list_units(
        &self,
    ) -> zbus::Result<
        Vec<(
            String,
            String,
            String,
            String,
            String,
            String,
            zbus::zvariant::OwnedObjectPath,
            u32,
            String,
            zbus::zvariant::OwnedObjectPath,
        )>,
    >;

    /// Start a unit
    fn start_unit(&self, name: &str, mode: &str) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;

    /// Stop a unit
    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<zbus::zvariant::OwnedObjectPath>;

    /// Restart a unit
    fn restart_unit(&self, name: &str, mode: &str)
    -> zbus::Result<zbus::zvariant::OwnedObjectPath>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitAction {
    Start,
    Stop,
    Restart,
}

impl UnitAction {
    pub fn label(&self) -> &'static str {
        match self {
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Restart => "restart",
        }
    }
}

impl fmt::Display for UnitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why the service manager refused a control call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFailure {
    NoSuchUnit,
    AccessDenied,
    TimedOut,
    Rejected,
}

impl ControlFailure {
    /// Classify a D-Bus error name
    pub fn from_error_name(name: &str) -> Self {
        match name {
            "org.freedesktop.systemd1.NoSuchUnit" | "org.freedesktop.systemd1.LoadFailed" => {
                ControlFailure::NoSuchUnit
            }
            "org.freedesktop.DBus.Error.AccessDenied"
            | "org.freedesktop.DBus.Error.InteractiveAuthorizationRequired" => {
                ControlFailure::AccessDenied
            }
            "org.freedesktop.DBus.Error.Timeout" | "org.freedesktop.DBus.Error.NoReply" => {
                ControlFailure::TimedOut
            }
            _ => ControlFailure::Rejected,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SystemdError {
    #[error("failed to {action} {unit}: {reason}")]
    Control {
        action: UnitAction,
        unit: String,
        failure: ControlFailure,
        reason: String,
    },

    #[error("service manager unavailable: {0}")]
    Unavailable(String),
}

impl SystemdError {
    fn control(action: UnitAction, unit: &str, err: zbus::Error) -> Self {
        let (failure, reason) = match &err {
            zbus::Error::MethodError(name, detail, _) => (
                ControlFailure::from_error_name(name.as_str()),
                match detail {
                    Some(detail) => format!("{}: {}", name.as_str(), detail),
                    None => name.as_str().to_string(),
                },
            ),
            zbus::Error::FDO(e) => {
                let failure = match **e {
                    zbus::fdo::Error::AccessDenied(_)
                    | zbus::fdo::Error::InteractiveAuthorizationRequired(_) => {
                        ControlFailure::AccessDenied
                    }
                    zbus::fdo::Error::NoReply(_) | zbus::fdo::Error::Timeout(_) => {
                        ControlFailure::TimedOut
                    }
                    _ => ControlFailure::Rejected,
                };
                (failure, e.to_string())
            }
            other => (ControlFailure::Rejected, other.to_string()),
        };

        SystemdError::Control {
            action,
            unit: unit.to_string(),
            failure,
            reason,
        }
    }
}

/// Which bus to reach systemd on
#[derive(Debug, Clone, Default)]
pub struct BusConfig {
    pub user: bool,
    pub address: Option<String>,
    pub call_timeout: Duration,
    pub systemctl: Option<String>,
}

#[derive(Clone)]
pub struct SystemdClient {
    connection: Connection,
    user_mode: bool,
    call_timeout: Duration,
    systemctl: String,
}

impl SystemdClient {
    pub async fn connect(config: &BusConfig) -> zbus::Result<Self> {
        let connection = match (&config.address, config.user) {
            (Some(address), _) => {
                let conn = zbus::connection::Builder::address(address.as_str())?
                    .build()
                    .await?;
                tracing::info!(address = %address, "Connected to D-Bus at explicit address");
                conn
            }
            (None, true) => {
                let conn = Connection::session().await?;
                tracing::info!("Connected to user D-Bus session");
                conn
            }
            (None, false) => {
                let conn = Connection::system().await?;
                if is_root() {
                    tracing::info!("Connected to system D-Bus as root");
                } else {
                    tracing::warn!(
                        "Connected to system D-Bus as non-root; unit control needs polkit authorization"
                    );
                }
                conn
            }
        };

        Ok(Self {
            connection,
            user_mode: config.user,
            call_timeout: config.call_timeout,
            systemctl: config
                .systemctl
                .clone()
                .unwrap_or_else(|| "systemctl".to_string()),
        })
    }

    pub fn is_user_mode(&self) -> bool {
        self.user_mode
    }

    /// Close the bus connection; every clone of this client stops working
    pub async fn close(self) {
        if let Err(e) = self.connection.close().await {
            tracing::warn!("Failed to close D-Bus connection: {}", e);
        }
    }

    /// Get the manager proxy for making calls
    async fn manager(&self) -> zbus::Result<SystemdManagerProxy<'_>> {
        SystemdManagerProxy::new(&self.connection).await
    }

    async fn bounded<T>(&self, call: impl Future<Output = zbus::Result<T>>) -> zbus::Result<T> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(zbus::Error::FDO(Box::new(zbus::fdo::Error::Timeout(
                format!("no reply within {:?}", self.call_timeout),
            )))),
        }
    }

    async fn list_units_dbus(&self) -> zbus::Result<Vec<UnitInfo>> {
        let manager = self.manager().await?;
        let units = self.bounded(manager.list_units()).await?;

        let unit_info: Vec<UnitInfo> = units
            .into_iter()
            .map(
                |(name, description, load_state, active_state, sub_state, _, _, _, _, _)| {
                    UnitInfo {
                        name,
                        description,
                        load_state,
                        active_state,
                        sub_state,
                    }
                },
            )
            .filter(|u| u.is_service())
            .collect();

        Ok(unit_info)
    }

    async fn list_units_systemctl(&self) -> Result<Vec<UnitInfo>, String> {
        let mut cmd = Command::new(&self.systemctl);
        if self.user_mode {
            cmd.arg("--user");
        }
        cmd.args([
            "list-units",
            "--type=service",
            "--all",
            "--no-pager",
            "--plain",
            "--no-legend",
        ])
        .kill_on_drop(true);

        let output = tokio::time::timeout(self.call_timeout, cmd.output())
            .await
            .map_err(|_| format!("systemctl timed out after {:?}", self.call_timeout))?
            .map_err(|e| format!("failed to run {}: {}", self.systemctl, e))?;
        if !output.status.success() {
            return Err(format!(
                "systemctl exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(parse_list_units(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn run_job(&self, action: UnitAction, name: &str) -> Result<(), SystemdError> {
        let manager = self
            .manager()
            .await
            .map_err(|e| SystemdError::control(action, name, e))?;
        let job = match action {
            UnitAction::Start => self.bounded(manager.start_unit(name, "replace")).await,
            UnitAction::Stop => self.bounded(manager.stop_unit(name, "replace")).await,
            UnitAction::Restart => self.bounded(manager.restart_unit(name, "replace")).await,
        }
        .map_err(|e| SystemdError::control(action, name, e))?;

        tracing::info!(unit = name, %action, job = %job.as_str(), "Queued unit job");
        Ok(())
    }
}

#[async_trait]
impl ServiceRegistry for SystemdClient {
    async fn list_services(&self) -> Result<Vec<UnitInfo>, SystemdError> {
        let mut units = match self.list_units_dbus().await {
            Ok(units) => units,
            Err(e) => {
                tracing::warn!("Failed to list units via D-Bus: {}, falling back to systemctl", e);
                self.list_units_systemctl().await.map_err(|fallback| {
                    tracing::error!("systemctl fallback also failed: {}", fallback);
                    SystemdError::Unavailable(format!("D-Bus: {}; systemctl: {}", e, fallback))
                })?
            }
        };
        units.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(units)
    }

    async fn control(&self, action: UnitAction, name: &str) -> Result<(), SystemdError> {
        self.run_job(action, name).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitInfo {
    pub name: String,
    pub description: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
}

impl UnitInfo {
    pub fn is_service(&self) -> bool {
        self.name.ends_with(".service")
    }

    /// Check if unit is active
    pub fn is_active(&self) -> bool {
        self.active_state == "active"
    }
}

/// Parse `systemctl list-units --plain --no-legend` output.
///
/// Columns are UNIT LOAD ACTIVE SUB DESCRIPTION; the description may contain spaces.
pub fn parse_list_units(output: &str) -> Vec<UnitInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut rest = line.trim_start_matches(|c: char| c.is_whitespace() || c == '●');
            let mut columns = [""; 4];
            for column in columns.iter_mut() {
                let end = rest.find(char::is_whitespace)?;
                *column = &rest[..end];
                rest = rest[end..].trim_start();
            }
            let [name, load_state, active_state, sub_state] = columns;
            Some(UnitInfo {
                name: name.to_string(),
                description: rest.trim_end().to_string(),
                load_state: load_state.to_string(),
                active_state: active_state.to_string(),
                sub_state: sub_state.to_string(),
            })
        })
        .filter(|u| u.is_service())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_list_units() {
        let output = "\
cron.service                 loaded active   running Regular background program processing daemon
● dead.service               loaded failed   failed  Something That Broke
user@1000.service            loaded active   running User Manager for UID 1000
dbus.socket                  loaded active   running D-Bus System Message Bus Socket
truncated.service loaded
";
        let units = parse_list_units(output);

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].name, "cron.service");
        assert_eq!(
            units[0].description,
            "Regular background program processing daemon"
        );
        assert!(units[0].is_active());
        assert_eq!(units[1].name, "dead.service");
        assert_eq!(units[1].active_state, "failed");
        assert_eq!(units[2].sub_state, "running");
    }

    #[test]
    fn classifies_dbus_error_names() {
        assert_eq!(
            ControlFailure::from_error_name("org.freedesktop.systemd1.NoSuchUnit"),
            ControlFailure::NoSuchUnit
        );
        assert_eq!(
            ControlFailure::from_error_name("org.freedesktop.DBus.Error.AccessDenied"),
            ControlFailure::AccessDenied
        );
        assert_eq!(
            ControlFailure::from_error_name(
                "org.freedesktop.DBus.Error.InteractiveAuthorizationRequired"
            ),
            ControlFailure::AccessDenied
        );
        assert_eq!(
            ControlFailure::from_error_name("org.freedesktop.systemd1.UnitMasked"),
            ControlFailure::Rejected
        );
    }

    #[test]
    fn fdo_errors_keep_their_message() {
        let err = SystemdError::control(
            UnitAction::Restart,
            "nginx.service",
            zbus::Error::FDO(Box::new(zbus::fdo::Error::AccessDenied(
                "Permission denied".to_string(),
            ))),
        );
        match &err {
            SystemdError::Control { failure, .. } => {
                assert_eq!(*failure, ControlFailure::AccessDenied)
            }
            other => panic!("unexpected {:?}", other),
        }
        let text = err.to_string();
        assert!(text.starts_with("failed to restart nginx.service"));
        assert!(text.contains("Permission denied"));
    }
}
