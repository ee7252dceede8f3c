//! Collaborator interfaces: the user store and the persistence store.
//!
//! The real-time core only talks to these traits. Lookups and writes here are
//! I/O and are never awaited while the connection registry is locked.

pub mod aurora;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kinship_shared::{
    Conversation, Identity, NewMessage, NewNotification, Notification, StoredMessage,
};

use crate::error::StoreError;

pub use aurora::AuroraStore;
pub use memory::MemoryStore;

/// The slice of a user account the real-time layer reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub is_active: bool,
    pub friends: Vec<String>,
    pub blocked_users: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
            is_active: true,
            friends: Vec::new(),
            blocked_users: Vec::new(),
            last_seen: None,
        }
    }

    pub fn has_blocked(&self, other: &str) -> bool {
        self.blocked_users.iter().any(|id| id == other)
    }

    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            name: self.name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError>;

    async fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn group_members(&self, group_id: &str) -> Result<Vec<String>, StoreError>;

    /// Friend ids of a user; empty when the user does not exist.
    async fn friends_of(&self, id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.find_user(id).await?.map(|u| u.friends).unwrap_or_default())
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn create_message(
        &self,
        sender_id: &str,
        recipient_id: &str,
        message: &NewMessage,
    ) -> Result<StoredMessage, StoreError>;

    /// Create the two-party conversation or move its last-message pointer.
    async fn upsert_conversation(&self, message: &StoredMessage) -> Result<Conversation, StoreError>;

    async fn find_message(&self, id: &str) -> Result<Option<StoredMessage>, StoreError>;

    /// Mark a message read. Returns the updated message, or `None` when it does
    /// not exist.
    async fn mark_message_read(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StoredMessage>, StoreError>;

    async fn create_notification(&self, notification: NewNotification) -> Result<Notification, StoreError>;

    async fn unread_notification_count(&self, recipient_id: &str) -> Result<u64, StoreError>;

    /// Mark the given notifications (or all of them) read for one recipient.
    /// Returns how many changed.
    async fn mark_notifications_read(
        &self,
        recipient_id: &str,
        ids: &[String],
        mark_all: bool,
    ) -> Result<u64, StoreError>;
}
