//! Process-local store. Backs `KINSHIP_STORE=memory` and every test.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kinship_shared::{
    Conversation, NewMessage, NewNotification, Notification, StoredMessage,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{Persistence, UserRecord, UserStore};
use crate::error::StoreError;

#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, UserRecord>>,
    groups: RwLock<HashMap<String, Vec<String>>>,
    messages: RwLock<HashMap<String, StoredMessage>>,
    conversations: RwLock<Vec<Conversation>>,
    notifications: RwLock<Vec<Notification>>,
    message_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: UserRecord) {
        self.users.write().await.insert(user.id.clone(), user);
    }

    pub async fn set_group_members(&self, group_id: &str, members: Vec<String>) {
        self.groups.write().await.insert(group_id.to_string(), members);
    }

    /// How many times `create_message` has been called.
    pub fn message_writes(&self) -> usize {
        self.message_writes.load(Ordering::SeqCst)
    }

    pub async fn notifications_for(&self, recipient_id: &str) -> Vec<Notification> {
        self.notifications
            .read()
            .await
            .iter()
            .filter(|n| n.recipient_id == recipient_id)
            .cloned()
            .collect()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.conversations.read().await.clone()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(user) = self.users.write().await.get_mut(id) {
            user.last_seen = Some(at);
        }
        Ok(())
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.groups.read().await.get(group_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn create_message(
        &self,
        sender_id: &str,
        recipient_id: &str,
        message: &NewMessage,
    ) -> Result<StoredMessage, StoreError> {
        self.message_writes.fetch_add(1, Ordering::SeqCst);

        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            content: message.content.clone(),
            kind: message.kind,
            image: message.image.clone(),
            file: message.file.clone(),
            reply_to: message.reply_to.clone(),
            is_read: false,
            read_at: None,
            created_at: Utc::now(),
        };
        self.messages
            .write()
            .await
            .insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn upsert_conversation(&self, message: &StoredMessage) -> Result<Conversation, StoreError> {
        let mut conversations = self.conversations.write().await;

        if let Some(existing) = conversations
            .iter_mut()
            .find(|c| c.involves(&message.sender_id, &message.recipient_id))
        {
            existing.last_message_id = message.id.clone();
            existing.last_message_at = message.created_at;
            return Ok(existing.clone());
        }

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            participants: vec![message.sender_id.clone(), message.recipient_id.clone()],
            last_message_id: message.id.clone(),
            last_message_at: message.created_at,
        };
        conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn find_message(&self, id: &str) -> Result<Option<StoredMessage>, StoreError> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn mark_message_read(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let mut messages = self.messages.write().await;
        Ok(messages.get_mut(id).map(|m| {
            if !m.is_read {
                m.is_read = true;
                m.read_at = Some(at);
            }
            m.clone()
        }))
    }

    async fn create_notification(&self, notification: NewNotification) -> Result<Notification, StoreError> {
        let stored = Notification {
            id: Uuid::new_v4().to_string(),
            recipient_id: notification.recipient_id,
            sender_id: notification.sender_id,
            kind: notification.kind,
            title: notification.title,
            message: notification.message,
            data: notification.data,
            is_read: false,
            created_at: Utc::now(),
        };
        self.notifications.write().await.push(stored.clone());
        Ok(stored)
    }

    async fn unread_notification_count(&self, recipient_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .notifications
            .read()
            .await
            .iter()
            .filter(|n| n.recipient_id == recipient_id && !n.is_read)
            .count() as u64)
    }

    async fn mark_notifications_read(
        &self,
        recipient_id: &str,
        ids: &[String],
        mark_all: bool,
    ) -> Result<u64, StoreError> {
        let mut changed = 0;
        for n in self.notifications.write().await.iter_mut() {
            if n.recipient_id != recipient_id || n.is_read {
                continue;
            }
            if mark_all || ids.contains(&n.id) {
                n.is_read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conversation_is_shared_by_both_directions() {
        let store = MemoryStore::new();
        let first = store
            .create_message("a", "b", &NewMessage::text("hi"))
            .await
            .unwrap();
        let c1 = store.upsert_conversation(&first).await.unwrap();

        let reply = store
            .create_message("b", "a", &NewMessage::text("hey"))
            .await
            .unwrap();
        let c2 = store.upsert_conversation(&reply).await.unwrap();

        assert_eq!(c1.id, c2.id);
        assert_eq!(c2.last_message_id, reply.id);
        assert_eq!(store.conversations().await.len(), 1);
        assert_eq!(store.message_writes(), 2);
    }

    #[tokio::test]
    async fn marking_notifications_only_touches_the_recipient() {
        let store = MemoryStore::new();
        let new = |to: &str| NewNotification {
            recipient_id: to.to_string(),
            sender_id: "s".to_string(),
            kind: kinship_shared::NotificationKind::Message,
            title: "t".to_string(),
            message: "m".to_string(),
            data: Default::default(),
        };
        let first = store.create_notification(new("a")).await.unwrap();
        store.create_notification(new("a")).await.unwrap();
        store.create_notification(new("b")).await.unwrap();

        let changed = store
            .mark_notifications_read("a", &[first.id.clone()], false)
            .await
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(store.unread_notification_count("a").await.unwrap(), 1);

        let changed = store.mark_notifications_read("a", &[], true).await.unwrap();
        assert_eq!(changed, 1);
        assert_eq!(store.unread_notification_count("a").await.unwrap(), 0);
        assert_eq!(store.unread_notification_count("b").await.unwrap(), 1);
    }
}
