use crate::app::AppState;
use crate::config::Credentials;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::{Authorization, HeaderMapExt};
use subtle::ConstantTimeEq;

/// HTTP Basic auth gate; a no-op when no credentials are configured
pub async fn require_basic_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.credentials.as_deref() else {
        return next.run(request).await;
    };

    match request.headers().typed_get::<Authorization<Basic>>() {
        Some(Authorization(basic)) if verify(expected, basic.username(), basic.password()) => {
            tracing::debug!(user = basic.username(), "authenticated request");
            next.run(request).await
        }
        Some(Authorization(basic)) => {
            tracing::warn!(user = basic.username(), "failed authentication attempt");
            unauthorized()
        }
        None => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic")],
        axum::Json(serde_json::json!({
            "error": "unauthorized",
            "message": "Invalid credentials",
        })),
    )
        .into_response()
}

/// Compare both halves without short-circuiting on the first mismatch
fn verify(expected: &Credentials, username: &str, password: &str) -> bool {
    let user_ok = expected.username.as_bytes().ct_eq(username.as_bytes());
    let pass_ok = expected.password.as_bytes().ct_eq(password.as_bytes());
    (user_ok & pass_ok).into()
}
