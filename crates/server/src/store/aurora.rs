//! Aurora document-database implementation of the store traits.
//!
//! Lists and nested objects are stored as JSON strings and flags as
//! `"true"`/`"false"`, matching how the rest of the schema is laid out.

use std::sync::Arc;

use async_trait::async_trait;
use aurora_db::{Aurora, Document, Value};
use chrono::{DateTime, Utc};
use kinship_shared::{
    Conversation, MessageKind, NewMessage, NewNotification, Notification, NotificationData,
    NotificationKind, StoredMessage,
};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::{Persistence, UserRecord, UserStore};
use crate::error::StoreError;

#[derive(Clone)]
pub struct AuroraStore {
    db: Arc<Aurora>,
}

impl AuroraStore {
    pub fn new(db: Aurora) -> Self {
        Self { db: Arc::new(db) }
    }

    async fn first(
        &self,
        collection: &str,
        field: &'static str,
        value: &str,
    ) -> Result<Option<Document>, StoreError> {
        let value = value.to_string();
        Ok(self
            .db
            .query(collection)
            .filter(|f| f.eq(field, value.clone()))
            .collect()
            .await
            .map_err(db_err)?
            .into_iter()
            .next())
    }
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn str_field(doc: &Document, key: &str) -> String {
    doc.data
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn opt_str_field(doc: &Document, key: &str) -> Option<String> {
    doc.data
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn bool_field(doc: &Document, key: &str) -> bool {
    doc.data.get(key).and_then(|v| v.as_str()) == Some("true")
}

fn json_field<T: DeserializeOwned + Default>(doc: &Document, key: &str) -> T {
    doc.data
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

fn time_field(doc: &Document, key: &str) -> Option<DateTime<Utc>> {
    doc.data
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn required_time(doc: &Document, collection: &str, key: &str) -> Result<DateTime<Utc>, StoreError> {
    time_field(doc, key).ok_or_else(|| StoreError::Corrupt {
        collection: collection.to_string(),
        detail: format!("document {} has no valid `{key}`", doc.id),
    })
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(db_err)
}

fn participant_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}|{b}")
    } else {
        format!("{b}|{a}")
    }
}

fn message_fields(message: &StoredMessage) -> Vec<(&'static str, Value)> {
    vec![
        ("id", message.id.clone().into()),
        ("sender_id", message.sender_id.clone().into()),
        ("recipient_id", message.recipient_id.clone().into()),
        ("content", message.content.clone().into()),
        ("kind", message.kind.as_str().into()),
        ("image", message.image.clone().unwrap_or_default().into()),
        ("file", message.file.clone().unwrap_or_default().into()),
        ("reply_to", message.reply_to.clone().unwrap_or_default().into()),
        ("is_read", flag(message.is_read).into()),
        ("read_at", message.read_at.map(|t| t.to_rfc3339()).unwrap_or_default().into()),
        ("created_at", message.created_at.to_rfc3339().into()),
    ]
}

fn conversation_fields(conversation: &Conversation, key: String) -> Result<Vec<(&'static str, Value)>, StoreError> {
    Ok(vec![
        ("id", conversation.id.clone().into()),
        ("participant_key", key.into()),
        ("participants", to_json(&conversation.participants)?.into()),
        ("last_message_id", conversation.last_message_id.clone().into()),
        ("last_message_at", conversation.last_message_at.to_rfc3339().into()),
    ])
}

fn notification_fields(notification: &Notification) -> Result<Vec<(&'static str, Value)>, StoreError> {
    Ok(vec![
        ("id", notification.id.clone().into()),
        ("recipient_id", notification.recipient_id.clone().into()),
        ("sender_id", notification.sender_id.clone().into()),
        ("kind", notification.kind.as_str().into()),
        ("title", notification.title.clone().into()),
        ("message", notification.message.clone().into()),
        ("data", to_json(&notification.data)?.into()),
        ("is_read", flag(notification.is_read).into()),
        ("created_at", notification.created_at.to_rfc3339().into()),
    ])
}

fn user_from_doc(doc: &Document) -> UserRecord {
    UserRecord {
        id: str_field(doc, "id"),
        name: str_field(doc, "name"),
        avatar: opt_str_field(doc, "avatar"),
        is_active: bool_field(doc, "is_active"),
        friends: json_field(doc, "friends"),
        blocked_users: json_field(doc, "blocked_users"),
        last_seen: time_field(doc, "last_seen"),
    }
}

fn message_from_doc(doc: &Document) -> Result<StoredMessage, StoreError> {
    Ok(StoredMessage {
        id: str_field(doc, "id"),
        sender_id: str_field(doc, "sender_id"),
        recipient_id: str_field(doc, "recipient_id"),
        content: str_field(doc, "content"),
        kind: MessageKind::parse(&str_field(doc, "kind")),
        image: opt_str_field(doc, "image"),
        file: opt_str_field(doc, "file"),
        reply_to: opt_str_field(doc, "reply_to"),
        is_read: bool_field(doc, "is_read"),
        read_at: time_field(doc, "read_at"),
        created_at: required_time(doc, "messages", "created_at")?,
    })
}

fn conversation_from_doc(doc: &Document) -> Result<Conversation, StoreError> {
    Ok(Conversation {
        id: str_field(doc, "id"),
        participants: json_field(doc, "participants"),
        last_message_id: str_field(doc, "last_message_id"),
        last_message_at: required_time(doc, "conversations", "last_message_at")?,
    })
}

fn notification_from_doc(doc: &Document) -> Result<Notification, StoreError> {
    let kind_raw = str_field(doc, "kind");
    let kind = NotificationKind::parse(&kind_raw).ok_or_else(|| StoreError::Corrupt {
        collection: "notifications".to_string(),
        detail: format!("unknown kind `{kind_raw}`"),
    })?;

    Ok(Notification {
        id: str_field(doc, "id"),
        recipient_id: str_field(doc, "recipient_id"),
        sender_id: str_field(doc, "sender_id"),
        kind,
        title: str_field(doc, "title"),
        message: str_field(doc, "message"),
        data: json_field::<NotificationData>(doc, "data"),
        is_read: bool_field(doc, "is_read"),
        created_at: required_time(doc, "notifications", "created_at")?,
    })
}

#[async_trait]
impl UserStore for AuroraStore {
    async fn find_user(&self, id: &str) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.first("users", "id", id).await?.as_ref().map(user_from_doc))
    }

    async fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(doc) = self.first("users", "id", id).await? {
            self.db
                .update_document("users", &doc.id, vec![("last_seen", at.to_rfc3339().into())])
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn group_members(&self, group_id: &str) -> Result<Vec<String>, StoreError> {
        let group_id = group_id.to_string();
        let docs = self
            .db
            .query("group_members")
            .filter(|f| f.eq("group_id", group_id.clone()))
            .collect()
            .await
            .map_err(db_err)?;

        Ok(docs.iter().map(|d| str_field(d, "user_id")).collect())
    }
}

#[async_trait]
impl Persistence for AuroraStore {
    async fn create_message(
        &self,
        sender_id: &str,
        recipient_id: &str,
        message: &NewMessage,
    ) -> Result<StoredMessage, StoreError> {
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

        self.db
            .insert_into("messages", message_fields(&stored))
            .await
            .map_err(db_err)?;

        Ok(stored)
    }

    async fn upsert_conversation(&self, message: &StoredMessage) -> Result<Conversation, StoreError> {
        let key = participant_key(&message.sender_id, &message.recipient_id);
        if let Some(doc) = self.first("conversations", "participant_key", &key).await? {
            self.db
                .update_document(
                    "conversations",
                    &doc.id,
                    vec![
                        ("last_message_id", message.id.clone().into()),
                        ("last_message_at", message.created_at.to_rfc3339().into()),
                    ],
                )
                .await
                .map_err(db_err)?;

            let mut conversation = conversation_from_doc(&doc)?;
            conversation.last_message_id = message.id.clone();
            conversation.last_message_at = message.created_at;
            return Ok(conversation);
        }

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            participants: vec![message.sender_id.clone(), message.recipient_id.clone()],
            last_message_id: message.id.clone(),
            last_message_at: message.created_at,
        };

        self.db
            .insert_into("conversations", conversation_fields(&conversation, key)?)
            .await
            .map_err(db_err)?;

        Ok(conversation)
    }

    async fn find_message(&self, id: &str) -> Result<Option<StoredMessage>, StoreError> {
        self.first("messages", "id", id)
            .await?
            .as_ref()
            .map(message_from_doc)
            .transpose()
    }

    async fn mark_message_read(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let Some(doc) = self.first("messages", "id", id).await? else {
            return Ok(None);
        };
        let mut message = message_from_doc(&doc)?;

        if !message.is_read {
            self.db
                .update_document(
                    "messages",
                    &doc.id,
                    vec![
                        ("is_read", flag(true).into()),
                        ("read_at", at.to_rfc3339().into()),
                    ],
                )
                .await
                .map_err(db_err)?;
            message.is_read = true;
            message.read_at = Some(at);
        }

        Ok(Some(message))
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

        self.db
            .insert_into("notifications", notification_fields(&stored)?)
            .await
            .map_err(db_err)?;

        Ok(stored)
    }

    async fn unread_notification_count(&self, recipient_id: &str) -> Result<u64, StoreError> {
        let recipient_id = recipient_id.to_string();
        let docs = self
            .db
            .query("notifications")
            .filter(|f| f.eq("recipient_id", recipient_id.clone()) & f.eq("is_read", "false".to_string()))
            .collect()
            .await
            .map_err(db_err)?;
        Ok(docs.len() as u64)
    }

    async fn mark_notifications_read(
        &self,
        recipient_id: &str,
        ids: &[String],
        mark_all: bool,
    ) -> Result<u64, StoreError> {
        let recipient = recipient_id.to_string();
        let unread = self
            .db
            .query("notifications")
            .filter(|f| f.eq("recipient_id", recipient.clone()) & f.eq("is_read", "false".to_string()))
            .collect()
            .await
            .map_err(db_err)?;

        let mut changed = 0;
        for doc in unread {
            let notification = notification_from_doc(&doc)?;
            if !mark_all && !ids.contains(&notification.id) {
                continue;
            }
            self.db
                .update_document("notifications", &doc.id, vec![("is_read", flag(true).into())])
                .await
                .map_err(db_err)?;
            changed += 1;
        }
        Ok(changed)
    }
}
