use axum::{extract::State, http::StatusCode, routing::get, Json, Router};

use crate::database::{check_health, HealthReport};
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let subscribers = state.hub.subscriber_count().await;
    let report = check_health(&state.pool, subscribers).await;

    let status = if report.is_up() {
        StatusCode::OK
    } else {
        tracing::warn!(error = ?report.error, "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(report))
}
