//! Shared data models for the kinship social backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Identity ---

/// A verified user as seen by the real-time layer.
///
/// Only the display fields needed for presence events are carried here; the
/// full profile lives in the user store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Presence snapshot of one online identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingUser {
    pub user_id: String,
    pub name: String,
    pub conversation_id: String,
}

// --- Messaging ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "image" => MessageKind::Image,
            "file" => MessageKind::File,
            _ => MessageKind::Text,
        }
    }
}

/// Message body as submitted by the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// A direct message after it has been made durable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Two-party conversation with a pointer to its latest message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<String>,
    pub last_message_id: String,
    pub last_message_at: DateTime<Utc>,
}

impl Conversation {
    pub fn involves(&self, a: &str, b: &str) -> bool {
        self.participants.iter().any(|p| p == a) && self.participants.iter().any(|p| p == b)
    }
}

// --- Notifications ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    FriendRequest,
    FriendAccept,
    PostReaction,
    PostComment,
    PostShare,
    GroupInvite,
    GroupJoin,
    Message,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::FriendRequest => "friend_request",
            NotificationKind::FriendAccept => "friend_accept",
            NotificationKind::PostReaction => "post_reaction",
            NotificationKind::PostComment => "post_comment",
            NotificationKind::PostShare => "post_share",
            NotificationKind::GroupInvite => "group_invite",
            NotificationKind::GroupJoin => "group_join",
            NotificationKind::Message => "message",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "friend_request" => Some(NotificationKind::FriendRequest),
            "friend_accept" => Some(NotificationKind::FriendAccept),
            "post_reaction" => Some(NotificationKind::PostReaction),
            "post_comment" => Some(NotificationKind::PostComment),
            "post_share" => Some(NotificationKind::PostShare),
            "group_invite" => Some(NotificationKind::GroupInvite),
            "group_join" => Some(NotificationKind::GroupJoin),
            "message" => Some(NotificationKind::Message),
            _ => None,
        }
    }
}

/// References to the entities a notification is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewNotification {
    pub recipient_id: String,
    pub sender_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: NotificationData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub sender_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub data: NotificationData,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// --- Posts ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Visibility {
    Public,
    Friends,
    Private,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ReactionKind {
    Like,
    Love,
    Haha,
    Wow,
    Sad,
    Angry,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ReactionAction {
    Added,
    Removed,
}

/// Per-kind reaction totals shared by posts and comments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReactionCounts {
    pub like: u32,
    pub love: u32,
    pub haha: u32,
    pub wow: u32,
    pub sad: u32,
    pub angry: u32,
}

impl ReactionCounts {
    fn slot(&mut self, kind: ReactionKind) -> &mut u32 {
        match kind {
            ReactionKind::Like => &mut self.like,
            ReactionKind::Love => &mut self.love,
            ReactionKind::Haha => &mut self.haha,
            ReactionKind::Wow => &mut self.wow,
            ReactionKind::Sad => &mut self.sad,
            ReactionKind::Angry => &mut self.angry,
        }
    }

    /// Apply one reaction change. Removing from an empty slot stays at zero.
    pub fn apply(&mut self, kind: ReactionKind, action: ReactionAction) {
        let slot = self.slot(kind);
        match action {
            ReactionAction::Added => *slot += 1,
            ReactionAction::Removed => *slot = slot.saturating_sub(1),
        }
    }

    pub fn total(&self) -> u32 {
        self.like + self.love + self.haha + self.wow + self.sad + self.angry
    }
}

/// What a reaction points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "targetType", rename_all = "camelCase")]
pub enum ReactionTarget {
    #[serde(rename_all = "camelCase")]
    Post { post_id: String },
    #[serde(rename_all = "camelCase")]
    Comment { comment_id: String, post_id: String },
}

impl ReactionTarget {
    /// The post whose viewers care about this reaction.
    pub fn post_id(&self) -> &str {
        match self {
            ReactionTarget::Post { post_id } => post_id,
            ReactionTarget::Comment { post_id, .. } => post_id,
        }
    }
}

/// Anything that can be reacted to.
pub trait HasReactions {
    fn reaction_target(&self) -> ReactionTarget;
    fn reactions(&self) -> &ReactionCounts;
    fn reactions_mut(&mut self) -> &mut ReactionCounts;

    fn react(&mut self, kind: ReactionKind, action: ReactionAction) -> ReactionCounts {
        self.reactions_mut().apply(kind, action);
        self.reactions().clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: String,
    pub author_id: String,
    #[serde(default)]
    pub content: Option<String>,
    pub visibility: Visibility,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default)]
    pub reactions: ReactionCounts,
    pub created_at: DateTime<Utc>,
}

impl HasReactions for Post {
    fn reaction_target(&self) -> ReactionTarget {
        ReactionTarget::Post {
            post_id: self.id.clone(),
        }
    }

    fn reactions(&self) -> &ReactionCounts {
        &self.reactions
    }

    fn reactions_mut(&mut self) -> &mut ReactionCounts {
        &mut self.reactions
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_comment: Option<String>,
    #[serde(default)]
    pub reactions: ReactionCounts,
    pub created_at: DateTime<Utc>,
}

impl HasReactions for Comment {
    fn reaction_target(&self) -> ReactionTarget {
        ReactionTarget::Comment {
            comment_id: self.id.clone(),
            post_id: self.post_id.clone(),
        }
    }

    fn reactions(&self) -> &ReactionCounts {
        &self.reactions
    }

    fn reactions_mut(&mut self) -> &mut ReactionCounts {
        &mut self.reactions
    }
}

// --- Friends ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FriendRequestAction {
    Sent,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequestUpdate {
    pub request_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub action: FriendRequestAction,
    pub timestamp: DateTime<Utc>,
}

// --- System ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SystemLevel {
    #[default]
    Info,
    Warning,
    Error,
}

// --- Socket API ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OnlineCountResponse {
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserOnlineResponse {
    pub user_id: String,
    pub is_online: bool,
}

/// Body of `POST /api/socket/broadcast`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BroadcastRequest {
    pub message: String,
    #[serde(rename = "type", default)]
    pub level: SystemLevel,
}
