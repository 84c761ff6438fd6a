use crate::app::AppState;
use crate::error::ApiError;
use crate::systemd::canonical_unit_name;
use crate::systemd::client::{UnitAction, UnitInfo};
use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value, json};

pub async fn list_services(State(state): State<AppState>) -> Result<Json<Vec<UnitInfo>>, ApiError> {
    let units = state.registry.list_services().await?;
    tracing::info!(
        count = units.len(),
        active = units.iter().filter(|u| u.is_active()).count(),
        "listed services"
    );
    Ok(Json(units))
}

pub async fn start_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    control(&state, UnitAction::Start, &name).await
}

pub async fn stop_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    control(&state, UnitAction::Stop, &name).await
}

pub async fn restart_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    control(&state, UnitAction::Restart, &name).await
}

async fn control(state: &AppState, action: UnitAction, name: &str) -> Result<Json<Value>, ApiError> {
    let unit = canonical_unit_name(name)
        .ok_or_else(|| ApiError::validation(format!("invalid unit name {:?}", name)))?;

    match action {
        UnitAction::Start => state.registry.start(&unit).await?,
        UnitAction::Stop => state.registry.stop(&unit).await?,
        UnitAction::Restart => state.registry.restart(&unit).await?,
    }

    Ok(Json(json!({
        "unit": unit,
        "action": action,
        "status": "ok",
    })))
}
