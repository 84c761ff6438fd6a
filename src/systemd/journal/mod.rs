//! Journal access through an ordered list of providers.
//!
//! Every call walks the providers in order and returns the first success, so the
//! structured reader is preferred and `journalctl` only serves when it fails.

pub mod cli;
pub mod native;

use crate::systemd::logs::LogEntry;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use cli::CliProvider;
pub use native::NativeProvider;

/// Live journal entries, ending only when the source dies or the server shuts down.
/// Dropping it releases the underlying subscription.
pub type LiveStream = BoxStream<'static, LogEntry>;

/// Entries buffered between a follow reader and its HTTP client
pub(crate) const FOLLOW_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("{call} failed: {}", errno_text(.errno))]
    Native { call: &'static str, errno: i32 },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("journal reader stopped unexpectedly")]
    ReaderGone,

    #[error("no journal provider could serve the request: {0}")]
    SourceUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub unit: Option<String>,
    pub limit: usize,
}

/// One way of reading the journal
#[async_trait]
pub trait JournalProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Up to `query.limit` newest entries, oldest first
    async fn fetch_recent(&self, query: &LogQuery) -> Result<Vec<LogEntry>, JournalError>;

    /// Entries appended after this call; no history
    async fn open_live_stream(&self, unit: Option<&str>) -> Result<LiveStream, JournalError>;
}

pub struct Journal {
    providers: Vec<Arc<dyn JournalProvider>>,
    call_timeout: Duration,
    shutdown: CancellationToken,
}

impl Journal {
    pub fn new(
        providers: Vec<Arc<dyn JournalProvider>>,
        call_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            providers,
            call_timeout,
            shutdown,
        }
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Fetch the newest `limit` entries in ascending timestamp order
    pub async fn fetch_recent(&self, query: &LogQuery) -> Result<Vec<LogEntry>, JournalError> {
        let mut failures = Vec::new();

        for provider in &self.providers {
            let result = tokio::time::timeout(self.call_timeout, provider.fetch_recent(query))
                .await
                .unwrap_or(Err(JournalError::Timeout(self.call_timeout)));

            match result {
                Ok(mut entries) => {
                    entries.sort_by_key(|e| e.timestamp);
                    if entries.len() > query.limit {
                        entries.drain(..entries.len() - query.limit);
                    }
                    tracing::debug!(
                        provider = provider.name(),
                        unit = query.unit.as_deref().unwrap_or("*"),
                        count = entries.len(),
                        "fetched journal entries"
                    );
                    return Ok(entries);
                }
                Err(e) => {
                    tracing::warn!(provider = provider.name(), "journal fetch failed: {}", e);
                    failures.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        Err(JournalError::SourceUnavailable(summarize(failures)))
    }

    /// Subscribe to entries appended from now on.
    ///
    /// Entries stamped before the call are dropped, and the stream ends when the
    /// server shuts down.
    pub async fn open_live_stream(&self, unit: Option<&str>) -> Result<LiveStream, JournalError> {
        let opened_at = Utc::now();
        let mut failures = Vec::new();

        for provider in &self.providers {
            let result = tokio::time::timeout(self.call_timeout, provider.open_live_stream(unit))
                .await
                .unwrap_or(Err(JournalError::Timeout(self.call_timeout)));

            match result {
                Ok(stream) => {
                    tracing::info!(
                        provider = provider.name(),
                        unit = unit.unwrap_or("*"),
                        "opened live journal stream"
                    );
                    let stream = stream
                        .filter(move |entry| futures::future::ready(entry.timestamp >= opened_at))
                        .take_until(self.shutdown.clone().cancelled_owned());
                    return Ok(stream.boxed());
                }
                Err(e) => {
                    tracing::warn!(provider = provider.name(), "journal follow failed: {}", e);
                    failures.push(format!("{}: {}", provider.name(), e));
                }
            }
        }

        Err(JournalError::SourceUnavailable(summarize(failures)))
    }
}

fn errno_text(errno: &i32) -> String {
    std::io::Error::from_raw_os_error(*errno).to_string()
}

fn summarize(failures: Vec<String>) -> String {
    if failures.is_empty() {
        "no providers configured".to_string()
    } else {
        failures.join("; ")
    }
}
