//! Socket status and broadcast routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kinship_shared::{BroadcastRequest, OnlineCountResponse, UserOnlineResponse};

use crate::error::DeliveryError;
use crate::middleware::AuthenticatedUser;
use crate::state::AppState;

/// `GET /api/socket/online-count`
pub async fn online_count(State(state): State<AppState>) -> Json<OnlineCountResponse> {
    Json(OnlineCountResponse {
        count: state.registry.online_count().await,
    })
}

/// `GET /api/socket/user/{user_id}/online`
pub async fn user_online(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    _caller: AuthenticatedUser,
) -> Json<UserOnlineResponse> {
    let is_online = state.registry.is_online(&user_id).await;
    Json(UserOnlineResponse { user_id, is_online })
}

/// `POST /api/socket/broadcast`
///
/// Answers 202 straight away; the fan-out runs in the background and nobody
/// waits for it.
pub async fn broadcast(
    State(state): State<AppState>,
    AuthenticatedUser(caller): AuthenticatedUser,
    Json(request): Json<BroadcastRequest>,
) -> Result<StatusCode, DeliveryError> {
    if request.message.trim().is_empty() {
        return Err(DeliveryError::InvalidRequest("message is required".to_string()));
    }

    tracing::info!(user_id = %caller.id, level = ?request.level, "system broadcast requested");
    let router = state.router.clone();
    tokio::spawn(async move {
        let delivered = router.broadcast_system(request.message, request.level).await;
        tracing::debug!(delivered, "system broadcast sent");
    });

    Ok(StatusCode::ACCEPTED)
}
