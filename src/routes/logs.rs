use crate::app::AppState;
use crate::error::ApiError;
use crate::systemd::canonical_unit_name;
use crate::systemd::journal::LogQuery;
use crate::systemd::logs::LogEntry;
use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    pub service: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub service: Option<String>,
}

/// Resolve `?service=` the way the control routes resolve unit names.
///
/// An empty value means no filter.
fn service_filter(service: Option<String>) -> Result<Option<String>, ApiError> {
    match service.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(name) => canonical_unit_name(name)
            .map(Some)
            .ok_or_else(|| ApiError::validation(format!("invalid unit name {:?}", name))),
    }
}

pub async fn recent_logs(
    State(state): State<AppState>,
    params: Result<Query<RecentParams>, QueryRejection>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::validation(e.body_text()))?;
    let unit = service_filter(params.service)?;

    let limit = match params.limit {
        None => state.limits.default,
        Some(n) if n >= 1 && n as u64 <= state.limits.max as u64 => n as usize,
        Some(n) => {
            return Err(ApiError::validation(format!(
                "limit must be between 1 and {}, got {}",
                state.limits.max, n
            )));
        }
    };
    let query = LogQuery { unit, limit };

    let entries = state.journal.fetch_recent(&query).await?;
    tracing::info!(
        unit = query.unit.as_deref().unwrap_or("*"),
        limit,
        count = entries.len(),
        "served journal snapshot"
    );
    Ok(Json(entries))
}

pub async fn stream_logs(
    State(state): State<AppState>,
    params: Result<Query<StreamParams>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::validation(e.body_text()))?;
    let unit = service_filter(params.service)?;

    let live = state.journal.open_live_stream(unit.as_deref()).await?;
    let events = live.filter_map(|entry| async move { to_event(&entry).map(Ok::<_, Infallible>) });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// One SSE event per entry; the journal cursor doubles as the event id
fn to_event(entry: &LogEntry) -> Option<Event> {
    match Event::default().json_data(entry) {
        Ok(event) => Some(match &entry.cursor {
            Some(cursor) if !cursor.contains(['\n', '\r', '\0']) => event.id(cursor),
            _ => event,
        }),
        Err(e) => {
            tracing::warn!("failed to encode log entry: {}", e);
            None
        }
    }
}
