use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::state::AppState;

/// GET /health/live: returns 200 unconditionally.
pub async fn liveness() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /health/ready: reports the number of live connections.
pub async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.relay.connections.len(),
    }))
}
