use axum::extract::{Path, State};
use axum::Json;
use chatkey_shared::api::relay::PresenceResponse;
use chatkey_shared::error::ChatKeyError;
use chatkey_shared::ids::UserId;

use crate::error::ServerError;
use crate::state::AppState;

/// GET /presence/{user_id}: whether the user is connected and when they
/// were last seen. Clients use it to gate key rotation.
pub async fn get_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<PresenceResponse>, ServerError> {
    let user_id: UserId = user_id
        .parse()
        .map_err(|_| ServerError(ChatKeyError::Validation("invalid user id".into())))?;
    Ok(Json(state.relay.presence(user_id)))
}
