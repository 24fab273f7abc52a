//! Row -> wire model conversions.
//!
//! Corrupt ids or timestamps are logged and replaced with defaults rather
//! than failing the whole response.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use savor_db::models::{CommentRow, ConversationRow, MessageRow, PostRow};
use savor_types::models::{
    CommentNode, Conversation, Message, MessagePreview, Participant, Post,
};

pub fn uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

pub fn time(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') has no timezone: "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}': {}", raw, e);
            DateTime::default()
        })
}

pub fn post(row: PostRow) -> Post {
    Post {
        id: uuid(&row.id, "post id"),
        author_id: uuid(&row.author_id, "author id"),
        author_username: row.author_username,
        caption: row.caption,
        media_path: row.media_path,
        likes_count: row.likes_count,
        comments_count: row.comments_count,
        shares_count: row.shares_count,
        user_has_liked: row.viewer_liked,
        created_at: time(&row.created_at),
    }
}

/// A single comment without replies. The client assembles the tree.
pub fn comment(row: CommentRow) -> CommentNode {
    CommentNode {
        id: uuid(&row.id, "comment id"),
        post_id: uuid(&row.post_id, "post id"),
        author_id: uuid(&row.author_id, "author id"),
        author_username: row.author_username,
        parent_id: row.parent_id.as_deref().map(|p| uuid(p, "parent id")),
        content: if row.is_deleted { String::new() } else { row.content },
        like_count: row.like_count,
        user_has_liked: row.viewer_liked,
        is_deleted: row.is_deleted,
        created_at: time(&row.created_at),
        replies: Vec::<Arc<CommentNode>>::new(),
    }
}

pub fn message(row: MessageRow) -> Message {
    Message {
        id: uuid(&row.id, "message id"),
        conversation_id: uuid(&row.conversation_id, "conversation id"),
        sender_id: uuid(&row.sender_id, "sender id"),
        body: row.body,
        created_at: time(&row.created_at),
        delivered_at: row.delivered_at.as_deref().map(time),
        read_at: row.read_at.as_deref().map(time),
    }
}

pub fn conversation(row: ConversationRow) -> Conversation {
    Conversation {
        id: uuid(&row.id, "conversation id"),
        participants: row
            .participants
            .into_iter()
            .map(|p| Participant {
                user_id: uuid(&p.user_id, "participant id"),
                username: p.username,
                unread_count: p.unread_count,
            })
            .collect(),
        last_message: row.last_message.map(|m| MessagePreview {
            message_id: uuid(&m.id, "message id"),
            sender_id: uuid(&m.sender_id, "sender id"),
            body: m.body,
            created_at: time(&m.created_at),
        }),
        updated_at: time(&row.updated_at),
    }
}
