use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt; // for `oneshot`

use chatkey_relay::config::RelayConfig;
use chatkey_relay::router::build_router;
use chatkey_relay::state::AppState;
use chatkey_shared::api::relay::PresenceResponse;
use chatkey_shared::ids::UserId;

fn test_state() -> AppState {
    AppState::new(RelayConfig::default())
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn health_live_returns_200_with_status_ok() {
    let (status, json) = get_json(build_router(test_state()), "/health/live").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn health_ready_counts_connections() {
    let state = test_state();
    let (_, _rx) = state.relay.register(UserId::new());
    let (status, json) = get_json(build_router(state), "/health/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["connections"], 1);
}

#[tokio::test]
async fn presence_reports_connected_user_online() {
    let state = test_state();
    let user = UserId::new();
    let (_, _rx) = state.relay.register(user);

    let (status, json) = get_json(build_router(state), &format!("/presence/{user}")).await;
    assert_eq!(status, StatusCode::OK);
    let presence: PresenceResponse = serde_json::from_value(json).unwrap();
    assert_eq!(presence.user_id, user);
    assert!(presence.online);
    assert!(presence.last_seen.is_some());
}

#[tokio::test]
async fn presence_of_unknown_user_is_offline() {
    let user = UserId::new();
    let (status, json) = get_json(build_router(test_state()), &format!("/presence/{user}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["online"], false);
    assert!(json["last_seen"].is_null());
}

#[tokio::test]
async fn presence_rejects_malformed_user_id() {
    let (status, json) = get_json(build_router(test_state()), "/presence/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "invalid user id");
}

#[tokio::test]
async fn requests_include_x_request_id_header() {
    let app = build_router(test_state());
    let request = Request::builder()
        .uri("/health/live")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    let id = response
        .headers()
        .get("x-request-id")
        .expect("response should include x-request-id");
    uuid::Uuid::parse_str(id.to_str().unwrap()).expect("x-request-id should be a valid UUID");
}

#[tokio::test]
async fn ws_without_upgrade_headers_is_rejected() {
    let app = build_router(test_state());
    let request = Request::builder()
        .uri(format!("/ws?user_id={}", UserId::new()))
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn unknown_routes_return_404() {
    let app = build_router(test_state());
    let request = Request::builder()
        .uri("/nonexistent")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
