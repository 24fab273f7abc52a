use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical table names used in change notifications.
pub mod tables {
    pub const POSTS: &str = "posts";
    pub const LIKES: &str = "likes";
    pub const SHARES: &str = "shares";
    pub const FOLLOWS: &str = "follows";
    pub const COMMENTS: &str = "comments";
    pub const COMMENT_LIKES: &str = "comment_likes";
    pub const CONVERSATIONS: &str = "conversations";
    pub const MESSAGES: &str = "messages";
}

/// What happened to a row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// The row after the change (before it, for deletes).
    pub record: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind, record: serde_json::Value) -> Self {
        Self {
            table: table.into(),
            kind,
            record,
            at: Utc::now(),
        }
    }
}

/// Scopes a subscription to one table, and optionally to rows whose
/// `column` equals `value` (compared as strings).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChangeFilter {
    pub table: String,
    pub column: Option<String>,
    pub value: Option<String>,
}

impl ChangeFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: None,
            value: None,
        }
    }

    /// `table` rows where `column = value`.
    pub fn eq(table: impl Into<String>, column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            table: table.into(),
            column: Some(column.into()),
            value: Some(value.to_string()),
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        let (Some(column), Some(value)) = (&self.column, &self.value) else {
            return true;
        };
        match event.record.get(column) {
            Some(serde_json::Value::String(s)) => s == value,
            Some(serde_json::Value::Array(items)) => items.iter().any(|item| match item {
                serde_json::Value::String(s) => s == value,
                other => other.to_string() == *value,
            }),
            Some(serde_json::Value::Null) | None => false,
            Some(other) => other.to_string() == *value,
        }
    }
}

/// Commands sent FROM client TO server over the realtime websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeCommand {
    /// Authenticate the connection
    Identify { token: String },

    /// Start receiving events that match `filter`, tagged with `subscription`.
    Subscribe { subscription: u64, filter: ChangeFilter },

    /// Stop a subscription opened earlier on this connection
    Unsubscribe { subscription: u64 },
}

/// Frames sent FROM server TO client over the realtime websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeMessage {
    /// Server confirms successful authentication
    Ready { user_id: uuid::Uuid },

    /// A change matched one of the client's subscriptions
    Change { subscription: u64, event: ChangeEvent },

    /// A command could not be honoured
    Error { message: String },
}
