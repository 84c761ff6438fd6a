use axum::Json;
use serde_json::{Value, json};

pub async fn index() -> Json<Value> {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Liveness only; never touches systemd
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use crate::routes::testing::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn health_needs_no_systemd_and_no_auth() {
        let state = with_credentials(
            state(
                FakeRegistry {
                    unavailable: true,
                    ..Default::default()
                },
                Vec::new(),
            ),
            "admin",
            "s3cret",
        );

        let response = send(state, get("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn index_reports_name() {
        let response = send(state(FakeRegistry::default(), Vec::new()), get("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["name"], "sysdash");
    }
}
