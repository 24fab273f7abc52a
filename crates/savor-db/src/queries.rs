use crate::models::{
    CommentRow, ConversationRow, MessageRow, ParticipantRow, PostRow, UserRow,
};
use crate::{Database, now};
use anyhow::{Result, anyhow};
use rusqlite::{Connection, Row};
use savor_types::models::InteractionKind;

const POST_COLUMNS: &str = "
    p.id, p.author_id, COALESCE(u.username, 'unknown'), p.caption, p.media_path,
    (SELECT COUNT(*) FROM interactions i WHERE i.target_id = p.id AND i.kind = 'like'),
    (SELECT COUNT(*) FROM comments c WHERE c.post_id = p.id AND c.is_deleted = 0),
    (SELECT COUNT(*) FROM interactions i WHERE i.target_id = p.id AND i.kind = 'share'),
    EXISTS(SELECT 1 FROM interactions i
           WHERE i.target_id = p.id AND i.kind = 'like' AND i.actor_id = ?1),
    p.created_at";

const COMMENT_COLUMNS: &str = "
    c.id, c.post_id, c.author_id, COALESCE(u.username, 'unknown'), c.parent_id, c.content,
    (SELECT COUNT(*) FROM interactions i WHERE i.target_id = c.id AND i.kind = 'comment_like'),
    EXISTS(SELECT 1 FROM interactions i
           WHERE i.target_id = c.id AND i.kind = 'comment_like' AND i.actor_id = ?1),
    c.is_deleted, c.created_at";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, body, created_at, delivered_at, read_at";

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                (id, username, password_hash, now()),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    // -- Posts --

    pub fn insert_post(
        &self,
        id: &str,
        author_id: &str,
        caption: &str,
        media_path: Option<&str>,
    ) -> Result<PostRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO posts (id, author_id, caption, media_path, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, author_id, caption, media_path, now()],
            )?;
            query_post(conn, author_id, id)?.ok_or_else(|| anyhow!("Post vanished: {}", id))
        })
    }

    pub fn get_post(&self, viewer_id: &str, id: &str) -> Result<Option<PostRow>> {
        self.with_conn(|conn| query_post(conn, viewer_id, id))
    }

    /// Newest first. `before` is an exclusive `created_at` cursor.
    pub fn list_feed(
        &self,
        viewer_id: &str,
        before: Option<&str>,
        limit: u32,
    ) -> Result<Vec<PostRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {POST_COLUMNS}
                 FROM posts p
                 LEFT JOIN users u ON p.author_id = u.id
                 WHERE (?2 IS NULL OR p.created_at < ?2)
                 ORDER BY p.created_at DESC
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![viewer_id, before, limit], post_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Interactions --

    /// Insert an interaction and return the target's new count for `kind`.
    /// Fails with a unique violation when a unique interaction already exists.
    pub fn insert_interaction(
        &self,
        id: &str,
        actor_id: &str,
        target_id: &str,
        kind: InteractionKind,
    ) -> Result<u32> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            insert_interaction_in(&tx, id, actor_id, target_id, kind)?;
            let count = count_interactions_in(&tx, target_id, kind)?;
            tx.commit()?;
            Ok(count)
        })
    }

    /// Remove an interaction. Returns (removed, new count).
    pub fn delete_interaction(
        &self,
        actor_id: &str,
        target_id: &str,
        kind: InteractionKind,
    ) -> Result<(bool, u32)> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM interactions WHERE actor_id = ?1 AND target_id = ?2 AND kind = ?3",
                (actor_id, target_id, kind.as_str()),
            )? > 0;
            let count = count_interactions_in(&tx, target_id, kind)?;
            tx.commit()?;
            Ok((removed, count))
        })
    }

    /// Toggle a unique interaction: removes if it exists, inserts if not.
    /// Returns (active, new count).
    pub fn toggle_interaction(
        &self,
        id: &str,
        actor_id: &str,
        target_id: &str,
        kind: InteractionKind,
    ) -> Result<(bool, u32)> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM interactions WHERE actor_id = ?1 AND target_id = ?2 AND kind = ?3",
                    (actor_id, target_id, kind.as_str()),
                    |row| row.get(0),
                )
                .optional()?;

            let active = match existing {
                Some(existing_id) => {
                    tx.execute("DELETE FROM interactions WHERE id = ?1", [&existing_id])?;
                    false
                }
                None => {
                    insert_interaction_in(&tx, id, actor_id, target_id, kind)?;
                    true
                }
            };
            let count = count_interactions_in(&tx, target_id, kind)?;
            tx.commit()?;
            Ok((active, count))
        })
    }

    pub fn has_interaction(
        &self,
        actor_id: &str,
        target_id: &str,
        kind: InteractionKind,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM interactions
                               WHERE actor_id = ?1 AND target_id = ?2 AND kind = ?3)",
                (actor_id, target_id, kind.as_str()),
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    pub fn count_interactions(&self, target_id: &str, kind: InteractionKind) -> Result<u32> {
        self.with_conn(|conn| count_interactions_in(conn, target_id, kind))
    }

    // -- Comments --

    pub fn insert_comment(
        &self,
        id: &str,
        post_id: &str,
        author_id: &str,
        parent_id: Option<&str>,
        content: &str,
    ) -> Result<CommentRow> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO comments (id, post_id, author_id, parent_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![id, post_id, author_id, parent_id, content, now()],
            )?;
            query_comment(conn, author_id, id)?.ok_or_else(|| anyhow!("Comment vanished: {}", id))
        })
    }

    pub fn get_comment(&self, viewer_id: &str, id: &str) -> Result<Option<CommentRow>> {
        self.with_conn(|conn| query_comment(conn, viewer_id, id))
    }

    /// Every comment on a post, oldest first, soft-deleted ones included.
    pub fn list_comments(&self, viewer_id: &str, post_id: &str) -> Result<Vec<CommentRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {COMMENT_COLUMNS}
                 FROM comments c
                 LEFT JOIN users u ON c.author_id = u.id
                 WHERE c.post_id = ?2
                 ORDER BY c.created_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map((viewer_id, post_id), comment_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Soft delete. Only the author may delete; returns the post id when a
    /// row was flagged.
    pub fn soft_delete_comment(&self, id: &str, author_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let post_id = conn
                .query_row(
                    "UPDATE comments SET is_deleted = 1
                     WHERE id = ?1 AND author_id = ?2 AND is_deleted = 0
                     RETURNING post_id",
                    (id, author_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(post_id)
        })
    }

    // -- Conversations --

    /// The two-person conversation between `a` and `b`, if one exists.
    pub fn find_direct_conversation(&self, a: &str, b: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT p1.conversation_id
                     FROM conversation_participants p1
                     JOIN conversation_participants p2
                       ON p1.conversation_id = p2.conversation_id
                     WHERE p1.user_id = ?1 AND p2.user_id = ?2
                       AND (SELECT COUNT(*) FROM conversation_participants x
                            WHERE x.conversation_id = p1.conversation_id) = 2
                     LIMIT 1",
                    (a, b),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
    }

    pub fn create_conversation(&self, id: &str, participant_ids: &[&str]) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let at = now();
            tx.execute(
                "INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
                (id, &at),
            )?;
            for user_id in participant_ids {
                tx.execute(
                    "INSERT INTO conversation_participants (conversation_id, user_id)
                     VALUES (?1, ?2)",
                    (id, user_id),
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| load_conversation(conn, id))
    }

    /// Conversations `user_id` takes part in, most recently active first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id FROM conversations c
                 JOIN conversation_participants p ON p.conversation_id = c.id
                 WHERE p.user_id = ?1
                 ORDER BY c.updated_at DESC",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let mut conversations = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(conversation) = load_conversation(conn, &id)? {
                    conversations.push(conversation);
                }
            }
            Ok(conversations)
        })
    }

    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM conversation_participants
                               WHERE conversation_id = ?1 AND user_id = ?2)",
                (conversation_id, user_id),
                |row| row.get(0),
            )?;
            Ok(exists)
        })
    }

    // -- Messages --

    /// Insert a message, bump the conversation and every other participant's
    /// unread counter.
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        body: &str,
    ) -> Result<MessageRow> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let at = now();
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, conversation_id, sender_id, body, &at),
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                (conversation_id, &at),
            )?;
            tx.execute(
                "UPDATE conversation_participants SET unread_count = unread_count + 1
                 WHERE conversation_id = ?1 AND user_id != ?2",
                (conversation_id, sender_id),
            )?;
            let row = query_message(&tx, id)?.ok_or_else(|| anyhow!("Message vanished: {}", id))?;
            tx.commit()?;
            Ok(row)
        })
    }

    /// The newest `limit` messages, oldest first. Messages from other senders
    /// are stamped delivered to `viewer_id` on the way out.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        viewer_id: &str,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET delivered_at = ?3
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND delivered_at IS NULL",
                (conversation_id, viewer_id, now()),
            )?;

            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM (
                     SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1
                     ORDER BY created_at DESC
                     LIMIT ?2
                 ) ORDER BY created_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Mark everything other participants sent as read by `user_id` and zero
    /// their unread counter. Returns how many messages changed.
    pub fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let at = now();
            let changed = tx.execute(
                "UPDATE messages
                 SET read_at = ?3, delivered_at = COALESCE(delivered_at, ?3)
                 WHERE conversation_id = ?1 AND sender_id != ?2 AND read_at IS NULL",
                (conversation_id, user_id, &at),
            )?;
            tx.execute(
                "UPDATE conversation_participants SET unread_count = 0
                 WHERE conversation_id = ?1 AND user_id = ?2",
                (conversation_id, user_id),
            )?;
            tx.commit()?;
            Ok(changed)
        })
    }

    // -- Devices --

    /// Fails with a unique violation when the token is already registered.
    pub fn insert_device(&self, token: &str, user_id: &str, platform: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO devices (token, user_id, platform, created_at) VALUES (?1, ?2, ?3, ?4)",
                (token, user_id, platform, now()),
            )?;
            Ok(())
        })
    }

    pub fn delete_device(&self, user_id: &str, token: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM devices WHERE user_id = ?1 AND token = ?2",
                (user_id, token),
            )?;
            Ok(removed > 0)
        })
    }

    // -- Files --

    pub fn insert_file(
        &self,
        path: &str,
        owner_id: &str,
        bucket: &str,
        content_type: &str,
        size: i64,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO files (path, owner_id, bucket, content_type, size, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![path, owner_id, bucket, content_type, size, now()],
            )?;
            Ok(())
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT id, username, password, created_at FROM users WHERE {column} = ?1");
    let row = conn
        .query_row(&sql, [value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_post(conn: &Connection, viewer_id: &str, id: &str) -> Result<Option<PostRow>> {
    let sql = format!(
        "SELECT {POST_COLUMNS}
         FROM posts p
         LEFT JOIN users u ON p.author_id = u.id
         WHERE p.id = ?2"
    );
    Ok(conn.query_row(&sql, (viewer_id, id), post_from_row).optional()?)
}

fn post_from_row(row: &Row<'_>) -> rusqlite::Result<PostRow> {
    Ok(PostRow {
        id: row.get(0)?,
        author_id: row.get(1)?,
        author_username: row.get(2)?,
        caption: row.get(3)?,
        media_path: row.get(4)?,
        likes_count: row.get(5)?,
        comments_count: row.get(6)?,
        shares_count: row.get(7)?,
        viewer_liked: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn query_comment(conn: &Connection, viewer_id: &str, id: &str) -> Result<Option<CommentRow>> {
    let sql = format!(
        "SELECT {COMMENT_COLUMNS}
         FROM comments c
         LEFT JOIN users u ON c.author_id = u.id
         WHERE c.id = ?2"
    );
    Ok(conn.query_row(&sql, (viewer_id, id), comment_from_row).optional()?)
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<CommentRow> {
    Ok(CommentRow {
        id: row.get(0)?,
        post_id: row.get(1)?,
        author_id: row.get(2)?,
        author_username: row.get(3)?,
        parent_id: row.get(4)?,
        content: row.get(5)?,
        like_count: row.get(6)?,
        viewer_liked: row.get(7)?,
        is_deleted: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn insert_interaction_in(
    conn: &Connection,
    id: &str,
    actor_id: &str,
    target_id: &str,
    kind: InteractionKind,
) -> Result<()> {
    conn.execute(
        "INSERT INTO interactions (id, actor_id, target_id, kind, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (id, actor_id, target_id, kind.as_str(), now()),
    )?;
    Ok(())
}

fn count_interactions_in(conn: &Connection, target_id: &str, kind: InteractionKind) -> Result<u32> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM interactions WHERE target_id = ?1 AND kind = ?2",
        (target_id, kind.as_str()),
        |row| row.get(0),
    )?;
    Ok(count)
}

fn load_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let updated_at: Option<String> = conn
        .query_row(
            "SELECT updated_at FROM conversations WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(updated_at) = updated_at else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT p.conversation_id, p.user_id, COALESCE(u.username, 'unknown'), p.unread_count
         FROM conversation_participants p
         LEFT JOIN users u ON p.user_id = u.id
         WHERE p.conversation_id = ?1
         ORDER BY u.username",
    )?;
    let participants = stmt
        .query_map([id], |row| {
            Ok(ParticipantRow {
                conversation_id: row.get(0)?,
                user_id: row.get(1)?,
                username: row.get(2)?,
                unread_count: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE conversation_id = ?1
         ORDER BY created_at DESC
         LIMIT 1"
    );
    let last_message = conn.query_row(&sql, [id], message_from_row).optional()?;

    Ok(Some(ConversationRow {
        id: id.to_string(),
        updated_at,
        participants,
        last_message,
    }))
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], message_from_row).optional()?)
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        body: row.get(3)?,
        created_at: row.get(4)?,
        delivered_at: row.get(5)?,
        read_at: row.get(6)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
