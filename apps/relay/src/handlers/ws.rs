use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::Response;
use chatkey_shared::error::ChatKeyError;
use chatkey_shared::ids::UserId;
use serde::Deserialize;

use crate::connection::handle_connection;
use crate::error::ServerError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct WsQueryParams {
    pub user_id: String,
}

/// GET /ws?user_id=<uuid>: upgrade to the signal relay socket.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsQueryParams>,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let user_id: UserId = params
        .user_id
        .parse()
        .map_err(|_| ServerError(ChatKeyError::Validation("invalid user id".into())))?;
    // Frames above the soft limit get an error frame; far larger ones drop the socket.
    let hard_limit = state.config.max_frame_bytes.saturating_mul(4);

    Ok(ws
        .max_message_size(hard_limit)
        .on_upgrade(move |socket| handle_connection(socket, state, user_id)))
}
