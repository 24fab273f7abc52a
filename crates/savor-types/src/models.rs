use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Kinds of user interaction the backend records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Like,
    Share,
    Follow,
    CommentLike,
}

impl InteractionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Share => "share",
            Self::Follow => "follow",
            Self::CommentLike => "comment_like",
        }
    }

    /// Shares are counted every time; the rest are unique per (actor, target).
    pub fn is_unique(self) -> bool {
        !matches!(self, Self::Share)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionRecord {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub target_id: Uuid,
    pub kind: InteractionKind,
    pub created_at: DateTime<Utc>,
}

/// One entry of the feed, as seen by the requesting user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Post {
    pub id: Uuid,
    pub author_id: Uuid,
    pub author_username: String,
    pub caption: String,
    pub media_path: Option<String>,
    pub likes_count: u32,
    pub comments_count: u32,
    pub shares_count: u32,
    pub user_has_liked: bool,
    pub created_at: DateTime<Utc>,
}

/// A comment with its replies.
///
/// Replies are reference counted so that a point update can hand back a new
/// tree that reuses every branch it did not touch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommentNode {
    pub id: Uuid,
    pub post_id: Uuid,
    pub author_id: Uuid,
    pub author_username: String,
    pub parent_id: Option<Uuid>,
    pub content: String,
    pub like_count: u32,
    pub user_has_liked: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub replies: Vec<Arc<CommentNode>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub user_id: Uuid,
    pub username: String,
    pub unread_count: u32,
}

/// Denormalized preview of the newest message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePreview {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Participant>,
    pub last_message: Option<MessagePreview>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn unread_for(&self, user_id: Uuid) -> u32 {
        self.participants
            .iter()
            .find(|p| p.user_id == user_id)
            .map_or(0, |p| p.unread_count)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DevicePlatform {
    Web,
    Android,
    Ios,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceToken {
    pub user_id: Uuid,
    pub token: String,
    pub platform: DevicePlatform,
    pub created_at: DateTime<Utc>,
}
