//! Application state shared across request handlers.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::realtime::{
    ConnectionRegistry, EventRouter, IdentityVerifier, JwtVerifier, MessageDelivery, Notifier,
    SessionManager,
};
use crate::store::{Persistence, UserStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<EventRouter>,
    pub sessions: Arc<SessionManager>,
    pub delivery: Arc<MessageDelivery>,
    pub notifier: Arc<Notifier>,
}

impl AppState {
    /// Wire the real-time core over one store that serves both roles, with a
    /// JWT verifier keyed by the configured secret.
    pub fn new<S>(config: ServerConfig, store: Arc<S>) -> Self
    where
        S: UserStore + Persistence + 'static,
    {
        let verifier = Arc::new(JwtVerifier::new(config.jwt_secret.as_bytes()));
        Self::with_parts(config, store.clone(), store, verifier)
    }

    pub fn with_parts(
        config: ServerConfig,
        users: Arc<dyn UserStore>,
        persistence: Arc<dyn Persistence>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(EventRouter::new(
            Arc::clone(&registry),
            Arc::clone(&users),
            config.fanout_batch,
        ));
        let notifier = Arc::new(Notifier::new(Arc::clone(&persistence), Arc::clone(&router)));
        let sessions = Arc::new(SessionManager::new(
            verifier,
            Arc::clone(&users),
            Arc::clone(&registry),
            Arc::clone(&router),
        ));
        let delivery = Arc::new(MessageDelivery::new(
            users,
            persistence,
            Arc::clone(&registry),
            Arc::clone(&router),
            Arc::clone(&notifier),
        ));

        Self {
            config: Arc::new(config),
            registry,
            router,
            sessions,
            delivery,
            notifier,
        }
    }
}
