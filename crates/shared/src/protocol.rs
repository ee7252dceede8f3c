//! WebSocket protocol: the envelope, client commands and server events.
//!
//! Both directions are closed tagged unions (`{"type": ..., "data": ...}`).
//! Frames with an unknown `type` are rejected at decode time instead of being
//! passed through untyped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    Comment, FriendRequestAction, FriendRequestUpdate, MessageKind, NewMessage, Notification,
    OnlineUser, Post, ReactionAction, ReactionCounts, ReactionKind, ReactionTarget, StoredMessage,
    SystemLevel,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> WsEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }

    pub fn correlated(payload: T, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..Self::new(payload)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ClientCommand {
    #[serde(rename = "room.join", rename_all = "camelCase")]
    JoinRoom { room_id: String },
    #[serde(rename = "room.leave", rename_all = "camelCase")]
    LeaveRoom { room_id: String },
    #[serde(rename = "message.send", rename_all = "camelCase")]
    SendMessage {
        recipient_id: String,
        #[serde(flatten)]
        message: NewMessage,
    },
    #[serde(rename = "message.read", rename_all = "camelCase")]
    MessageRead { message_id: String },
    #[serde(rename = "typing.start", rename_all = "camelCase")]
    TypingStart {
        recipient_id: String,
        conversation_id: String,
    },
    #[serde(rename = "typing.stop", rename_all = "camelCase")]
    TypingStop {
        recipient_id: String,
        conversation_id: String,
    },
    #[serde(rename = "notification.read", rename_all = "camelCase")]
    NotificationRead {
        #[serde(default)]
        notification_ids: Vec<String>,
        #[serde(default)]
        mark_all: bool,
    },
    #[serde(rename = "presence.friends")]
    GetOnlineFriends,
    #[serde(rename = "presence.count")]
    GetOnlineCount,
    #[serde(rename = "presence.lastSeen")]
    UpdateLastSeen,
}

/// Payload of a live `message.received` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceived {
    pub message_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub conversation_id: String,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
}

impl MessageReceived {
    pub fn from_stored(message: &StoredMessage, conversation_id: &str, sender_name: &str) -> Self {
        Self {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            conversation_id: conversation_id.to_string(),
            content: message.content.clone(),
            kind: message.kind,
            image: message.image.clone(),
            file: message.file.clone(),
            reply_to: message.reply_to.clone(),
            sender_name: sender_name.to_string(),
            timestamp: message.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename = "presence.online", rename_all = "camelCase")]
    PresenceOnline {
        user_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<String>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "presence.offline", rename_all = "camelCase")]
    PresenceOffline {
        user_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "message.received")]
    MessageReceived(MessageReceived),
    #[serde(rename = "message.delivered", rename_all = "camelCase")]
    MessageDelivered {
        message_id: String,
        conversation_id: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "message.read", rename_all = "camelCase")]
    MessageRead {
        message_id: String,
        read_by: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "typing.started", rename_all = "camelCase")]
    TypingStarted {
        user_id: String,
        name: String,
        conversation_id: String,
    },
    #[serde(rename = "typing.stopped", rename_all = "camelCase")]
    TypingStopped {
        user_id: String,
        conversation_id: String,
    },
    #[serde(rename = "notification.received")]
    NotificationReceived(Notification),
    #[serde(rename = "notification.count", rename_all = "camelCase")]
    NotificationCountUpdate { unread: u64 },
    #[serde(rename = "post.created", rename_all = "camelCase")]
    PostCreated {
        post: Post,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "post.reaction", rename_all = "camelCase")]
    PostReaction {
        target: ReactionTarget,
        user_id: String,
        reaction: ReactionKind,
        action: ReactionAction,
        counts: ReactionCounts,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "post.comment", rename_all = "camelCase")]
    PostComment {
        post_id: String,
        comment: Comment,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "friend.request")]
    FriendRequest(FriendRequestUpdate),
    #[serde(rename = "presence.friends", rename_all = "camelCase")]
    OnlineFriends { friends: Vec<OnlineUser> },
    #[serde(rename = "presence.count", rename_all = "camelCase")]
    OnlineCount { count: usize },
    #[serde(rename = "system.message", rename_all = "camelCase")]
    SystemMessage {
        message: String,
        level: SystemLevel,
        timestamp: DateTime<Utc>,
    },
    Ack {
        nonce: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        code: String,
        message: String,
        correlation_id: Option<String>,
    },
}

impl ServerEvent {
    /// Wire name of the event, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::PresenceOnline { .. } => "presence.online",
            ServerEvent::PresenceOffline { .. } => "presence.offline",
            ServerEvent::MessageReceived(_) => "message.received",
            ServerEvent::MessageDelivered { .. } => "message.delivered",
            ServerEvent::MessageRead { .. } => "message.read",
            ServerEvent::TypingStarted { .. } => "typing.started",
            ServerEvent::TypingStopped { .. } => "typing.stopped",
            ServerEvent::NotificationReceived(_) => "notification.received",
            ServerEvent::NotificationCountUpdate { .. } => "notification.count",
            ServerEvent::PostCreated { .. } => "post.created",
            ServerEvent::PostReaction { .. } => "post.reaction",
            ServerEvent::PostComment { .. } => "post.comment",
            ServerEvent::FriendRequest(update) => match update.action {
                FriendRequestAction::Sent => "friend.request.sent",
                FriendRequestAction::Accepted => "friend.request.accepted",
                FriendRequestAction::Rejected => "friend.request.rejected",
            },
            ServerEvent::OnlineFriends { .. } => "presence.friends",
            ServerEvent::OnlineCount { .. } => "presence.count",
            ServerEvent::SystemMessage { .. } => "system.message",
            ServerEvent::Ack { .. } => "ack",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code: code.into(),
            message: message.into(),
            correlation_id: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "MALFORMED_FRAME",
            ProtocolError::UnknownCommand(_) => "UNKNOWN_COMMAND",
        }
    }
}

const KNOWN_COMMANDS: &[&str] = &[
    "room.join",
    "room.leave",
    "message.send",
    "message.read",
    "typing.start",
    "typing.stop",
    "notification.read",
    "presence.friends",
    "presence.count",
    "presence.lastSeen",
];

/// Decode one text frame from a client.
///
/// Distinguishes an unknown command type from a known command with a bad
/// payload, so the caller can report which one happened.
pub fn decode_command(text: &str) -> Result<WsEnvelope<ClientCommand>, ProtocolError> {
    let raw: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProtocolError::Malformed("missing `type`".to_string()))?;

    if !KNOWN_COMMANDS.contains(&kind) {
        return Err(ProtocolError::UnknownCommand(kind.to_string()));
    }

    serde_json::from_value(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
