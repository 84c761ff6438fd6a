pub mod health;
pub mod logs;
pub mod services;

use crate::app::AppState;
use crate::auth::require_basic_auth;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/", get(health::index))
        .route("/services", get(services::list_services))
        .route("/services/", get(services::list_services))
        .route("/services/{name}/start", post(services::start_service))
        .route("/services/{name}/stop", post(services::stop_service))
        .route("/services/{name}/restart", post(services::restart_service))
        .route("/logs", get(logs::recent_logs))
        .route("/logs/", get(logs::recent_logs))
        .route("/logs/stream", get(logs::stream_logs))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_basic_auth,
        ));

    Router::new()
        .route("/health", get(health::health))
        .merge(protected)
        .with_state(state)
}
