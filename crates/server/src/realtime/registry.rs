//! Connection registry: who is online, and on which connections.
//!
//! Every map lives behind one mutex so compound steps ("remove this
//! connection, was it the last one?") are atomic. Nothing in here awaits I/O
//! while the lock is held; callers copy out what they need and do their
//! sending and store calls after the guard is dropped.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use kinship_shared::{Identity, OnlineUser, ServerEvent, TypingUser, WsEnvelope};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Outbound half of a connection's event queue. The connection's writer task
/// owns the receiving end.
pub type EventSender = mpsc::UnboundedSender<WsEnvelope<ServerEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One live transport session.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity_id: String,
    pub created_at: DateTime<Utc>,
    sender: EventSender,
}

impl ConnectionHandle {
    pub fn new(identity_id: impl Into<String>, sender: EventSender) -> Self {
        Self {
            id: ConnectionId::new(),
            identity_id: identity_id.into(),
            created_at: Utc::now(),
            sender,
        }
    }

    /// Queue an event for this connection. Fails only when the connection's
    /// writer has gone away.
    pub fn send(
        &self,
        envelope: WsEnvelope<ServerEvent>,
    ) -> Result<(), mpsc::error::SendError<WsEnvelope<ServerEvent>>> {
        self.sender.send(envelope)
    }
}

/// Presence record of an identity with at least one live connection.
#[derive(Debug, Clone, PartialEq)]
pub struct OnlineEntry {
    pub identity: Identity,
    /// Most recently registered connection that is still alive.
    pub connection_id: ConnectionId,
    pub last_seen: DateTime<Utc>,
}

impl OnlineEntry {
    pub fn to_online_user(&self) -> OnlineUser {
        OnlineUser {
            user_id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            avatar: self.identity.avatar.clone(),
            last_seen: self.last_seen,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingEntry {
    pub identity_id: String,
    pub name: String,
    pub conversation_id: String,
}

impl TypingEntry {
    pub fn to_typing_user(&self) -> TypingUser {
        TypingUser {
            user_id: self.identity_id.clone(),
            name: self.name.clone(),
            conversation_id: self.conversation_id.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Connection ids per identity, oldest first.
    by_identity: HashMap<String, Vec<ConnectionId>>,
    online: HashMap<String, OnlineEntry>,
    typing: HashMap<ConnectionId, TypingEntry>,
    rooms: HashMap<String, HashSet<ConnectionId>>,
}

impl Inner {
    /// Drop `id` from every index. Returns whether its identity has no
    /// connections left.
    fn detach(&mut self, id: ConnectionId, identity_id: &str) -> bool {
        self.connections.remove(&id);
        self.typing.remove(&id);
        self.rooms.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });

        let Some(ids) = self.by_identity.get_mut(identity_id) else {
            return false;
        };
        ids.retain(|c| *c != id);

        match ids.last().copied() {
            Some(newest) => {
                if let Some(entry) = self.online.get_mut(identity_id) {
                    entry.connection_id = newest;
                }
                false
            }
            None => {
                self.by_identity.remove(identity_id);
                self.online.remove(identity_id);
                true
            }
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `identity`. Returns `true` when this is the
    /// identity's first live connection. Re-adding a known connection id
    /// overwrites its handle.
    pub async fn add_connection(&self, identity: &Identity, mut handle: ConnectionHandle) -> bool {
        handle.identity_id = identity.id.clone();
        let id = handle.id;
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        if let Some(previous) = inner.connections.get(&id).map(|h| h.identity_id.clone()) {
            if previous != identity.id {
                inner.detach(id, &previous);
            }
        }

        inner.connections.insert(id, handle);
        let ids = inner.by_identity.entry(identity.id.clone()).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }

        let became_online = !inner.online.contains_key(&identity.id);
        inner.online.insert(
            identity.id.clone(),
            OnlineEntry {
                identity: identity.clone(),
                connection_id: id,
                last_seen: now,
            },
        );
        became_online
    }

    /// Remove a connection. Returns `true` when it was the identity's last
    /// one. Unknown ids, or an id registered to someone else, are a no-op.
    pub async fn remove_connection(&self, identity_id: &str, id: ConnectionId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.connections.get(&id) {
            Some(handle) if handle.identity_id == identity_id => inner.detach(id, identity_id),
            _ => false,
        }
    }

    pub async fn is_online(&self, identity_id: &str) -> bool {
        self.inner.lock().await.online.contains_key(identity_id)
    }

    pub async fn online_count(&self) -> usize {
        self.inner.lock().await.online.len()
    }

    pub async fn list_online(&self) -> Vec<OnlineEntry> {
        self.inner.lock().await.online.values().cloned().collect()
    }

    pub async fn online_ids(&self) -> Vec<String> {
        self.inner.lock().await.online.keys().cloned().collect()
    }

    /// Presence snapshots for those of `ids` that are online, in input order.
    pub async fn online_among(&self, ids: &[String]) -> Vec<OnlineUser> {
        let inner = self.inner.lock().await;
        ids.iter()
            .filter_map(|id| inner.online.get(id))
            .map(OnlineEntry::to_online_user)
            .collect()
    }

    pub async fn connections_of(&self, identity_id: &str) -> Vec<ConnectionId> {
        self.inner
            .lock()
            .await
            .by_identity
            .get(identity_id)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn handles_of(&self, identity_id: &str) -> Vec<ConnectionHandle> {
        let inner = self.inner.lock().await;
        inner
            .by_identity
            .get(identity_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }

    pub(crate) async fn all_handles(&self) -> Vec<ConnectionHandle> {
        self.inner.lock().await.connections.values().cloned().collect()
    }

    /// Refresh the cached last-seen time of an online identity.
    pub async fn touch(&self, identity_id: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.inner.lock().await.online.get_mut(identity_id) {
            entry.last_seen = at;
        }
    }

    /// Record that a connection is typing. Ignored for connections that are
    /// not registered to `identity_id`.
    pub async fn set_typing(
        &self,
        id: ConnectionId,
        identity_id: &str,
        name: &str,
        conversation_id: &str,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        let owned = matches!(inner.connections.get(&id), Some(h) if h.identity_id == identity_id);
        if owned {
            inner.typing.insert(
                id,
                TypingEntry {
                    identity_id: identity_id.to_string(),
                    name: name.to_string(),
                    conversation_id: conversation_id.to_string(),
                },
            );
        }
        owned
    }

    pub async fn clear_typing(&self, id: ConnectionId) -> Option<TypingEntry> {
        self.inner.lock().await.typing.remove(&id)
    }

    pub async fn typing_in(&self, conversation_id: &str) -> Vec<TypingEntry> {
        self.inner
            .lock()
            .await
            .typing
            .values()
            .filter(|t| t.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub async fn join_room(&self, id: ConnectionId, room: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.connections.contains_key(&id) {
            return false;
        }
        inner.rooms.entry(room.to_string()).or_default().insert(id)
    }

    pub async fn leave_room(&self, id: ConnectionId, room: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(members) = inner.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&id);
        if members.is_empty() {
            inner.rooms.remove(room);
        }
        removed
    }

    pub(crate) async fn room_handles(&self, room: &str) -> Vec<ConnectionHandle> {
        let inner = self.inner.lock().await;
        inner
            .rooms
            .get(room)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }
}
