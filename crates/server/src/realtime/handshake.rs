//! Handshake and session lifecycle.
//!
//! A connection is authenticated before anything touches the registry:
//! credential lookup, token verification, then the account check. Only a
//! fully verified user is registered, and only then are friends told.

use std::sync::Arc;

use axum::http::{header::AUTHORIZATION, HeaderMap};
use chrono::Utc;
use kinship_shared::Identity;
use tracing::{debug, error, info};

use super::registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, EventSender};
use super::router::EventRouter;
use super::verifier::IdentityVerifier;
use crate::error::{HandshakeError, StoreError};
use crate::store::{UserRecord, UserStore};

/// An authenticated, registered connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub identity: Identity,
}

/// Pick the bearer token out of the handshake. The structured auth field
/// (the `token` query parameter) wins over the `Authorization` header.
pub fn extract_credential(structured: Option<&str>, headers: &HeaderMap) -> Result<String, HandshakeError> {
    if let Some(token) = structured.map(str::trim).filter(|t| !t.is_empty()) {
        return Ok(token.to_string());
    }

    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .ok_or(HandshakeError::MissingCredential)
}

pub struct SessionManager {
    verifier: Arc<dyn IdentityVerifier>,
    users: Arc<dyn UserStore>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<EventRouter>,
}

impl SessionManager {
    pub fn new(
        verifier: Arc<dyn IdentityVerifier>,
        users: Arc<dyn UserStore>,
        registry: Arc<ConnectionRegistry>,
        router: Arc<EventRouter>,
    ) -> Self {
        Self {
            verifier,
            users,
            registry,
            router,
        }
    }

    /// Verify a bearer token and load the account behind it.
    pub async fn authenticate(&self, token: &str) -> Result<UserRecord, HandshakeError> {
        let verified = self.verifier.verify(token).map_err(|e| {
            debug!(reason = %e, "credential rejected");
            HandshakeError::InvalidCredential
        })?;

        let user = self
            .users
            .find_user(&verified.identity_id)
            .await?
            .ok_or(HandshakeError::IdentityNotFound)?;

        if !user.is_active {
            return Err(HandshakeError::IdentityInactive);
        }
        Ok(user)
    }

    /// Run the whole handshake against the connection's metadata.
    pub async fn handshake(&self, structured: Option<&str>, headers: &HeaderMap) -> Result<UserRecord, HandshakeError> {
        let token = extract_credential(structured, headers)?;
        self.authenticate(&token).await
    }

    /// Register a verified user's new connection. Store and fan-out failures
    /// after registration are logged, not returned: the connection is live.
    pub async fn open_session(&self, user: &UserRecord, sender: EventSender) -> Session {
        let identity = user.identity();
        let handle = ConnectionHandle::new(&identity.id, sender);
        let connection_id = handle.id;

        let became_online = self.registry.add_connection(&identity, handle).await;
        info!(user_id = %identity.id, connection_id = %connection_id, became_online, "connection opened");

        if became_online {
            if let Err(e) = self.users.touch_last_seen(&identity.id, Utc::now()).await {
                error!(user_id = %identity.id, error = %e, "failed to update last seen");
            }
            if let Err(e) = self.router.notify_presence(&identity, true).await {
                error!(user_id = %identity.id, error = %e, "failed to notify friends of presence");
            }
        }

        Session {
            connection_id,
            identity,
        }
    }

    /// Tear down a connection. Returns whether the identity went offline.
    pub async fn close_session(&self, session: &Session) -> bool {
        let identity = &session.identity;
        let was_last = self
            .registry
            .remove_connection(&identity.id, session.connection_id)
            .await;
        info!(user_id = %identity.id, connection_id = %session.connection_id, was_last, "connection closed");

        if was_last {
            if let Err(e) = self.users.touch_last_seen(&identity.id, Utc::now()).await {
                error!(user_id = %identity.id, error = %e, "failed to update last seen");
            }
            if let Err(e) = self.router.notify_presence(identity, false).await {
                error!(user_id = %identity.id, error = %e, "failed to notify friends of presence");
            }
        }
        was_last
    }

    pub async fn update_last_seen(&self, identity_id: &str) -> Result<(), StoreError> {
        let now = Utc::now();
        self.registry.touch(identity_id, now).await;
        self.users.touch_last_seen(identity_id, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::verifier::JwtVerifier;
    use crate::store::MemoryStore;
    use axum::http::HeaderValue;
    use chrono::Duration;
    use kinship_shared::{ServerEvent, WsEnvelope};
    use tokio::sync::mpsc;

    struct Harness {
        store: Arc<MemoryStore>,
        registry: Arc<ConnectionRegistry>,
        jwt: Arc<JwtVerifier>,
        sessions: SessionManager,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(EventRouter::new(Arc::clone(&registry), store.clone(), 64));
        let jwt = Arc::new(JwtVerifier::new(b"handshake-secret"));
        let sessions = SessionManager::new(jwt.clone(), store.clone(), Arc::clone(&registry), router);
        Harness {
            store,
            registry,
            jwt,
            sessions,
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        headers
    }

    #[test]
    fn structured_token_wins_over_header() {
        let token = extract_credential(Some("from-query"), &bearer("from-header")).unwrap();
        assert_eq!(token, "from-query");

        let token = extract_credential(Some(""), &bearer("from-header")).unwrap();
        assert_eq!(token, "from-header");

        assert_eq!(
            extract_credential(None, &HeaderMap::new()),
            Err(HandshakeError::MissingCredential)
        );
    }

    #[tokio::test]
    async fn handshake_failures_map_to_their_reasons() {
        let h = harness();
        let mut disabled = UserRecord::new("mallory", "Mallory");
        disabled.is_active = false;
        h.store.insert_user(disabled).await;

        let ghost = h.jwt.issue("ghost", Duration::hours(1)).unwrap();
        let mallory = h.jwt.issue("mallory", Duration::hours(1)).unwrap();

        assert_eq!(
            h.sessions.handshake(None, &HeaderMap::new()).await,
            Err(HandshakeError::MissingCredential)
        );
        assert_eq!(
            h.sessions.handshake(Some("garbage"), &HeaderMap::new()).await,
            Err(HandshakeError::InvalidCredential)
        );
        assert_eq!(
            h.sessions.handshake(Some(ghost.as_str()), &HeaderMap::new()).await,
            Err(HandshakeError::IdentityNotFound)
        );
        assert_eq!(
            h.sessions.handshake(None, &bearer(&mallory)).await,
            Err(HandshakeError::IdentityInactive)
        );
    }

    #[tokio::test]
    async fn expired_token_never_reaches_the_registry() {
        let h = harness();
        h.store.insert_user(UserRecord::new("alice", "Alice")).await;
        let expired = h.jwt.issue("alice", Duration::minutes(-10)).unwrap();

        let result = h.sessions.handshake(Some(expired.as_str()), &HeaderMap::new()).await;
        assert_eq!(result, Err(HandshakeError::InvalidCredential));
        assert_eq!(h.registry.online_count().await, 0);
        assert!(h.registry.connections_of("alice").await.is_empty());
    }

    #[tokio::test]
    async fn sessions_drive_presence_and_last_seen() {
        let h = harness();
        let mut alice = UserRecord::new("alice", "Alice");
        alice.friends = vec!["bob".to_string()];
        h.store.insert_user(alice.clone()).await;
        let bob = UserRecord::new("bob", "Bob");
        h.store.insert_user(bob.clone()).await;

        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel::<WsEnvelope<ServerEvent>>();
        h.sessions.open_session(&bob, bob_tx).await;

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let first = h.sessions.open_session(&alice, tx1).await;
        let second = h.sessions.open_session(&alice, tx2).await;

        let online: Vec<_> = std::iter::from_fn(|| bob_rx.try_recv().ok()).collect();
        assert_eq!(online.len(), 1, "one online event for two connections");
        assert!(h.store.find_user("alice").await.unwrap().unwrap().last_seen.is_some());

        assert!(!h.sessions.close_session(&second).await);
        assert!(bob_rx.try_recv().is_err(), "closing a non-last connection is silent");

        assert!(h.sessions.close_session(&first).await);
        let offline = bob_rx.try_recv().unwrap();
        assert!(matches!(offline.payload, ServerEvent::PresenceOffline { ref user_id, .. } if user_id == "alice"));
        assert!(!h.registry.is_online("alice").await);
    }
}
