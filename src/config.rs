use crate::systemd::client::BusConfig;
use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProviderKind {
    /// libsystemd sd-journal reader
    Native,
    /// `journalctl -o json` subprocess
    Cli,
}

/// systemd web dashboard API
#[derive(Debug, Clone, Parser)]
#[command(name = "sysdash", version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "SYSDASH_LISTEN", default_value = "0.0.0.0:8000")]
    pub listen: SocketAddr,

    /// Talk to the user service manager instead of the system one
    #[arg(long, env = "SYSDASH_USER")]
    pub user: bool,

    /// Explicit D-Bus address, e.g. unix:path=/run/dbus/system_bus_socket
    #[arg(long, env = "SYSDASH_BUS_ADDRESS")]
    pub bus_address: Option<String>,

    /// Read journal files from this directory instead of the local journal
    #[arg(long, env = "SYSDASH_JOURNAL_DIR")]
    pub journal_dir: Option<PathBuf>,

    /// journalctl binary used by the cli provider
    #[arg(long, env = "SYSDASH_JOURNALCTL", default_value = "journalctl")]
    pub journalctl: PathBuf,

    /// systemctl binary used when listing units over D-Bus fails
    #[arg(long, env = "SYSDASH_SYSTEMCTL", default_value = "systemctl")]
    pub systemctl: String,

    /// Journal providers, tried in order
    #[arg(
        long,
        env = "SYSDASH_JOURNAL_PROVIDERS",
        value_enum,
        value_delimiter = ',',
        default_value = "native,cli"
    )]
    pub journal_providers: Vec<ProviderKind>,

    /// Entries returned by /logs/ when no limit is given
    #[arg(long, env = "SYSDASH_DEFAULT_LIMIT", default_value_t = 100)]
    pub default_limit: usize,

    /// Largest limit /logs/ accepts
    #[arg(long, env = "SYSDASH_MAX_LIMIT", default_value_t = 1000)]
    pub max_limit: usize,

    /// Timeout for snapshot reads and unit control calls
    #[arg(long, env = "SYSDASH_CALL_TIMEOUT_SECS", default_value_t = 10)]
    pub call_timeout_secs: u64,

    /// HTTP Basic auth user; auth is enabled when user and password are both set
    #[arg(long, env = "AUTH_USERNAME")]
    pub auth_username: Option<String>,

    #[arg(long, env = "AUTH_PASSWORD", hide_env_values = true)]
    pub auth_password: Option<String>,
}

/// Bounds for the `limit` query parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLimits {
    pub default: usize,
    pub max: usize,
}

impl Default for LogLimits {
    fn default() -> Self {
        Self {
            default: 100,
            max: 1000,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Config {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn log_limits(&self) -> Result<LogLimits> {
        if self.max_limit == 0 {
            bail!("--max-limit must be at least 1");
        }
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            bail!(
                "--default-limit must be between 1 and --max-limit ({})",
                self.max_limit
            );
        }
        Ok(LogLimits {
            default: self.default_limit,
            max: self.max_limit,
        })
    }

    pub fn credentials(&self) -> Result<Option<Credentials>> {
        match (&self.auth_username, &self.auth_password) {
            (Some(username), _) if username.is_empty() => {
                bail!("--auth-username must not be empty")
            }
            (Some(username), Some(password)) => Ok(Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            })),
            (None, None) => Ok(None),
            _ => bail!("--auth-username and --auth-password must be set together"),
        }
    }

    pub fn bus(&self) -> BusConfig {
        BusConfig {
            user: self.user,
            address: self.bus_address.clone(),
            call_timeout: self.call_timeout(),
            systemctl: Some(self.systemctl.clone()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.log_limits()?;
        self.credentials()?;
        if self.journal_providers.is_empty() {
            bail!("--journal-providers needs at least one provider");
        }
        if self.call_timeout_secs == 0 {
            bail!("--call-timeout-secs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["sysdash"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.listen, "0.0.0.0:8000".parse().unwrap());
        assert_eq!(
            config.journal_providers,
            [ProviderKind::Native, ProviderKind::Cli]
        );
        assert_eq!(config.log_limits().unwrap(), LogLimits::default());
        assert_eq!(config.call_timeout(), Duration::from_secs(10));
        assert!(!config.bus().user);
    }

    #[test]
    fn provider_order_is_kept() {
        let config = parse(&["--journal-providers", "cli,native"]);
        assert_eq!(
            config.journal_providers,
            [ProviderKind::Cli, ProviderKind::Native]
        );

        let config = parse(&["--journal-providers", "cli"]);
        assert_eq!(config.journal_providers, [ProviderKind::Cli]);
    }

    #[test]
    fn rejects_unknown_provider() {
        assert!(Config::try_parse_from(["sysdash", "--journal-providers", "dbus"]).is_err());
    }

    #[test]
    fn limit_bounds_are_validated() {
        assert!(parse(&["--default-limit", "0"]).validate().is_err());
        assert!(parse(&["--default-limit", "50", "--max-limit", "10"]).validate().is_err());
        assert!(parse(&["--max-limit", "0"]).validate().is_err());
        assert_eq!(
            parse(&["--default-limit", "5", "--max-limit", "10"])
                .log_limits()
                .unwrap(),
            LogLimits { default: 5, max: 10 }
        );
    }

    #[test]
    fn credentials_need_both_halves() {
        assert!(parse(&[]).credentials().unwrap().is_none());
        assert!(parse(&["--auth-username", "admin"]).credentials().is_err());
        assert!(parse(&["--auth-password", "s3cret"]).credentials().is_err());

        let creds = parse(&["--auth-username", "admin", "--auth-password", "s3cret"])
            .credentials()
            .unwrap()
            .unwrap();
        assert_eq!(creds.username, "admin");
        assert!(!format!("{:?}", creds).contains("s3cret"));
    }

    #[test]
    fn empty_username_has_its_own_error() {
        let err = parse(&["--auth-username", "", "--auth-password", "s3cret"])
            .credentials()
            .unwrap_err();
        assert_eq!(err.to_string(), "--auth-username must not be empty");
    }
}
