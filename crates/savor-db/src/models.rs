//! Database row types. These map directly to SQLite rows and stay distinct
//! from the savor-types wire models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

/// A post joined with its counters, as seen by one viewer.
pub struct PostRow {
    pub id: String,
    pub author_id: String,
    pub author_username: String,
    pub caption: String,
    pub media_path: Option<String>,
    pub likes_count: u32,
    pub comments_count: u32,
    pub shares_count: u32,
    pub viewer_liked: bool,
    pub created_at: String,
}

pub struct CommentRow {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    pub author_username: String,
    pub parent_id: Option<String>,
    pub content: String,
    pub like_count: u32,
    pub viewer_liked: bool,
    pub is_deleted: bool,
    pub created_at: String,
}

pub struct ParticipantRow {
    pub conversation_id: String,
    pub user_id: String,
    pub username: String,
    pub unread_count: u32,
}

pub struct ConversationRow {
    pub id: String,
    pub updated_at: String,
    pub participants: Vec<ParticipantRow>,
    pub last_message: Option<MessageRow>,
}

pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: String,
    pub created_at: String,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
}
