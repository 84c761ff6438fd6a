use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::HashMap;

pub const FIELD_MESSAGE: &str = "MESSAGE";
pub const FIELD_PRIORITY: &str = "PRIORITY";
pub const FIELD_UNIT: &str = "_SYSTEMD_UNIT";
pub const FIELD_IDENTIFIER: &str = "SYSLOG_IDENTIFIER";
pub const FIELD_PID: &str = "_PID";
pub const FIELD_HOSTNAME: &str = "_HOSTNAME";
pub const FIELD_REALTIME: &str = "__REALTIME_TIMESTAMP";
pub const FIELD_CURSOR: &str = "__CURSOR";

/// Fields read from the native journal for every entry
pub const ENTRY_FIELDS: [&str; 6] = [
    FIELD_MESSAGE,
    FIELD_PRIORITY,
    FIELD_UNIT,
    FIELD_IDENTIFIER,
    FIELD_PID,
    FIELD_HOSTNAME,
];

/// Syslog severity as stored in the journal's PRIORITY field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Priority {
    pub fn from_level(level: u8) -> Option<Self> {
        Some(match level {
            0 => Priority::Emergency,
            1 => Priority::Alert,
            2 => Priority::Critical,
            3 => Priority::Error,
            4 => Priority::Warning,
            5 => Priority::Notice,
            6 => Priority::Info,
            7 => Priority::Debug,
            _ => return None,
        })
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// A normalized journal entry, identical whichever provider produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub priority: Option<Priority>,
    pub unit: Option<String>,
    pub pid: Option<u32>,
    pub message: String,
    pub hostname: Option<String>,
    pub cursor: Option<String>,
}

/// A record or line that could not become a `LogEntry`.
///
/// Never fatal: readers skip it and keep going.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("skipped journal record: {reason}")]
pub struct ParseSkipped {
    pub reason: String,
}

impl ParseSkipped {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Raw journal fields, keyed by field name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalRecord {
    fields: HashMap<String, String>,
}

impl JournalRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// Like `get`, but an empty value counts as absent
    pub fn get_non_empty(&self, field: &str) -> Option<&str> {
        self.get(field).filter(|v| !v.is_empty())
    }

    /// Parse one line of `journalctl -o json` output.
    ///
    /// String values are kept as-is. Fields journalctl could not print as text
    /// arrive as arrays of bytes and are decoded lossily; anything else is dropped.
    pub fn from_json_line(line: &str) -> Result<Self, ParseSkipped> {
        let value: serde_json::Value = serde_json::from_str(line.trim())
            .map_err(|e| ParseSkipped::new(format!("invalid JSON: {}", e)))?;
        let serde_json::Value::Object(object) = value else {
            return Err(ParseSkipped::new("expected a JSON object"));
        };

        let mut record = Self::new();
        for (field, value) in object {
            match value {
                serde_json::Value::String(s) => record.insert(field, s),
                serde_json::Value::Array(items) => {
                    let bytes: Option<Vec<u8>> = items
                        .iter()
                        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                        .collect();
                    if let Some(bytes) = bytes {
                        record.insert(field, String::from_utf8_lossy(&bytes).into_owned());
                    }
                }
                _ => {}
            }
        }
        Ok(record)
    }
}

/// Map a raw record onto a `LogEntry`.
///
/// Only the realtime timestamp is required; every other field degrades to `None`.
pub fn normalize(record: &JournalRecord) -> Result<LogEntry, ParseSkipped> {
    let micros = record
        .get(FIELD_REALTIME)
        .ok_or_else(|| ParseSkipped::new("missing __REALTIME_TIMESTAMP"))?;
    let micros: i64 = micros
        .trim()
        .parse()
        .map_err(|_| ParseSkipped::new(format!("bad __REALTIME_TIMESTAMP {:?}", micros)))?;
    let timestamp = DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| ParseSkipped::new(format!("timestamp {} out of range", micros)))?;

    let priority = record
        .get(FIELD_PRIORITY)
        .and_then(|p| p.trim().parse::<u8>().ok())
        .and_then(Priority::from_level);

    let unit = record
        .get_non_empty(FIELD_UNIT)
        .or_else(|| record.get_non_empty(FIELD_IDENTIFIER))
        .map(str::to_string);

    Ok(LogEntry {
        timestamp,
        priority,
        unit,
        pid: record.get(FIELD_PID).and_then(|p| p.trim().parse().ok()),
        message: record.get(FIELD_MESSAGE).unwrap_or_default().to_string(),
        hostname: record.get(FIELD_HOSTNAME).map(str::to_string),
        cursor: record.get(FIELD_CURSOR).map(str::to_string),
    })
}

/// Parse a batch of `journalctl -o json` lines, skipping what does not parse
pub fn parse_json_lines(output: &str) -> Vec<LogEntry> {
    let mut skipped = 0usize;
    let entries: Vec<LogEntry> = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            match JournalRecord::from_json_line(line).and_then(|r| normalize(&r)) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    skipped += 1;
                    tracing::debug!(reason = %e.reason, "skipping journal line");
                    None
                }
            }
        })
        .collect();

    if skipped > 0 {
        tracing::debug!(skipped, parsed = entries.len(), "journal batch had unparseable lines");
    }
    entries
}
