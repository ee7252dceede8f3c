//! Bearer-token extractor for the HTTP routes.

use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use kinship_shared::Identity;

use crate::error::HandshakeError;
use crate::realtime::extract_credential;
use crate::state::AppState;

/// Verified caller of an HTTP request, from `Authorization: Bearer <token>`.
///
/// Runs the same checks as the WebSocket handshake, so a deactivated account
/// is refused here too.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Identity);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = HandshakeError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let app_state = AppState::from_ref(state);
        let credential = extract_credential(None, &parts.headers);

        async move {
            let token = credential?;
            let user = app_state.sessions.authenticate(&token).await.map_err(|e| {
                tracing::debug!(code = e.code(), "request authentication failed");
                e
            })?;
            Ok(AuthenticatedUser(user.identity()))
        }
    }
}
