use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use savor_types::api::{Envelope, FeedPage, ShareResult, ToggleResult, UploadResponse};
use savor_types::models::{CommentNode, Conversation, DevicePlatform, Message, Post};

use crate::error::BackendError;

/// Raw access to the hosted backend. Implementations report failures as
/// [`BackendError`]; callers above the gateway never see those.
pub trait Backend: Send + Sync + 'static {
    fn fetch_feed(
        &self,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> impl Future<Output = Result<FeedPage, BackendError>> + Send;

    fn fetch_post(&self, post_id: Uuid) -> impl Future<Output = Result<Post, BackendError>> + Send;

    fn create_post(
        &self,
        caption: String,
        media_path: Option<String>,
    ) -> impl Future<Output = Result<Post, BackendError>> + Send;

    fn like_post(&self, post_id: Uuid) -> impl Future<Output = Result<ToggleResult, BackendError>> + Send;

    fn unlike_post(&self, post_id: Uuid) -> impl Future<Output = Result<ToggleResult, BackendError>> + Send;

    fn toggle_like(&self, post_id: Uuid) -> impl Future<Output = Result<ToggleResult, BackendError>> + Send;

    fn share_post(&self, post_id: Uuid) -> impl Future<Output = Result<ShareResult, BackendError>> + Send;

    fn fetch_comments(
        &self,
        post_id: Uuid,
    ) -> impl Future<Output = Result<Vec<CommentNode>, BackendError>> + Send;

    fn add_comment(
        &self,
        post_id: Uuid,
        content: String,
        parent_id: Option<Uuid>,
    ) -> impl Future<Output = Result<CommentNode, BackendError>> + Send;

    fn toggle_comment_like(
        &self,
        comment_id: Uuid,
    ) -> impl Future<Output = Result<ToggleResult, BackendError>> + Send;

    fn delete_comment(&self, comment_id: Uuid) -> impl Future<Output = Result<Uuid, BackendError>> + Send;

    fn follow_user(&self, user_id: Uuid) -> impl Future<Output = Result<ToggleResult, BackendError>> + Send;

    fn unfollow_user(&self, user_id: Uuid) -> impl Future<Output = Result<ToggleResult, BackendError>> + Send;

    fn follow_status(&self, user_id: Uuid) -> impl Future<Output = Result<ToggleResult, BackendError>> + Send;

    fn list_conversations(&self) -> impl Future<Output = Result<Vec<Conversation>, BackendError>> + Send;

    fn open_conversation(
        &self,
        with_user_id: Uuid,
    ) -> impl Future<Output = Result<Conversation, BackendError>> + Send;

    fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Message>, BackendError>> + Send;

    fn send_message(
        &self,
        conversation_id: Uuid,
        body: String,
    ) -> impl Future<Output = Result<Message, BackendError>> + Send;

    fn mark_read(&self, conversation_id: Uuid) -> impl Future<Output = Result<usize, BackendError>> + Send;

    fn register_device(
        &self,
        token: String,
        platform: DevicePlatform,
    ) -> impl Future<Output = Result<bool, BackendError>> + Send;

    fn unregister_device(&self, token: String) -> impl Future<Output = Result<bool, BackendError>> + Send;

    fn upload(
        &self,
        bucket: String,
        file_name: String,
        content_type: String,
        bytes: Bytes,
    ) -> impl Future<Output = Result<UploadResponse, BackendError>> + Send;
}

/// The one place backend calls go through.
///
/// Every operation answers with an [`Envelope`]: expected failures come back
/// as `success: false` with a display message, never as an error value.
/// Inserts into unique relations (likes, follows, device tokens) treat a
/// duplicate key as success with no authoritative data, so a stale UI that
/// repeats an insert keeps its optimistic state instead of rolling back.
pub struct Gateway<B> {
    backend: Arc<B>,
}

impl<B> Clone for Gateway<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: Backend> Gateway<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_shared(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // -- Feed / posts --

    pub async fn fetch_feed(&self, before: Option<DateTime<Utc>>, limit: u32) -> Envelope<FeedPage> {
        settle("fetch_feed", self.backend.fetch_feed(before, limit).await)
    }

    pub async fn fetch_post(&self, post_id: Uuid) -> Envelope<Post> {
        settle("fetch_post", self.backend.fetch_post(post_id).await)
    }

    pub async fn create_post(&self, caption: String, media_path: Option<String>) -> Envelope<Post> {
        settle("create_post", self.backend.create_post(caption, media_path).await)
    }

    pub async fn like_post(&self, post_id: Uuid) -> Envelope<ToggleResult> {
        settle_unique("like_post", self.backend.like_post(post_id).await)
    }

    pub async fn unlike_post(&self, post_id: Uuid) -> Envelope<ToggleResult> {
        settle("unlike_post", self.backend.unlike_post(post_id).await)
    }

    pub async fn toggle_like(&self, post_id: Uuid) -> Envelope<ToggleResult> {
        settle("toggle_like", self.backend.toggle_like(post_id).await)
    }

    pub async fn share_post(&self, post_id: Uuid) -> Envelope<ShareResult> {
        settle("share_post", self.backend.share_post(post_id).await)
    }

    // -- Comments --

    pub async fn fetch_comments(&self, post_id: Uuid) -> Envelope<Vec<CommentNode>> {
        settle("fetch_comments", self.backend.fetch_comments(post_id).await)
    }

    pub async fn add_comment(
        &self,
        post_id: Uuid,
        content: String,
        parent_id: Option<Uuid>,
    ) -> Envelope<CommentNode> {
        settle(
            "add_comment",
            self.backend.add_comment(post_id, content, parent_id).await,
        )
    }

    pub async fn toggle_comment_like(&self, comment_id: Uuid) -> Envelope<ToggleResult> {
        settle_unique(
            "toggle_comment_like",
            self.backend.toggle_comment_like(comment_id).await,
        )
    }

    pub async fn delete_comment(&self, comment_id: Uuid) -> Envelope<Uuid> {
        settle("delete_comment", self.backend.delete_comment(comment_id).await)
    }

    // -- Follows --

    pub async fn follow_user(&self, user_id: Uuid) -> Envelope<ToggleResult> {
        settle_unique("follow_user", self.backend.follow_user(user_id).await)
    }

    pub async fn unfollow_user(&self, user_id: Uuid) -> Envelope<ToggleResult> {
        settle("unfollow_user", self.backend.unfollow_user(user_id).await)
    }

    pub async fn follow_status(&self, user_id: Uuid) -> Envelope<ToggleResult> {
        settle("follow_status", self.backend.follow_status(user_id).await)
    }

    // -- Chat --

    pub async fn list_conversations(&self) -> Envelope<Vec<Conversation>> {
        settle("list_conversations", self.backend.list_conversations().await)
    }

    pub async fn open_conversation(&self, with_user_id: Uuid) -> Envelope<Conversation> {
        settle(
            "open_conversation",
            self.backend.open_conversation(with_user_id).await,
        )
    }

    pub async fn list_messages(&self, conversation_id: Uuid, limit: u32) -> Envelope<Vec<Message>> {
        settle(
            "list_messages",
            self.backend.list_messages(conversation_id, limit).await,
        )
    }

    pub async fn send_message(&self, conversation_id: Uuid, body: String) -> Envelope<Message> {
        settle(
            "send_message",
            self.backend.send_message(conversation_id, body).await,
        )
    }

    pub async fn mark_read(&self, conversation_id: Uuid) -> Envelope<usize> {
        settle("mark_read", self.backend.mark_read(conversation_id).await)
    }

    // -- Devices --

    pub async fn register_device(&self, token: String, platform: DevicePlatform) -> Envelope<bool> {
        settle_unique(
            "register_device",
            self.backend.register_device(token, platform).await,
        )
    }

    pub async fn unregister_device(&self, token: String) -> Envelope<bool> {
        settle("unregister_device", self.backend.unregister_device(token).await)
    }

    // -- Storage --

    pub async fn upload_media(
        &self,
        bucket: &str,
        file_name: &str,
        content_type: &str,
        bytes: Bytes,
    ) -> Envelope<UploadResponse> {
        settle(
            "upload_media",
            self.backend
                .upload(
                    bucket.to_string(),
                    file_name.to_string(),
                    content_type.to_string(),
                    bytes,
                )
                .await,
        )
    }
}

fn settle<T>(op: &'static str, result: Result<T, BackendError>) -> Envelope<T> {
    match result {
        Ok(data) => Envelope::ok(data),
        Err(e) => {
            match &e {
                BackendError::Validation(_) | BackendError::NotFound(_) => {
                    debug!("{} rejected: {}", op, e)
                }
                _ => warn!("{} failed: {}", op, e),
            }
            Envelope::fail(e.user_message())
        }
    }
}

/// Like [`settle`], for inserts into a relation with a uniqueness constraint.
fn settle_unique<T>(op: &'static str, result: Result<T, BackendError>) -> Envelope<T> {
    match result {
        Err(BackendError::Duplicate) => {
            debug!("{} hit an existing row, treating as applied", op);
            Envelope::ok_empty()
        }
        other => settle(op, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[tokio::test]
    async fn test_duplicate_like_is_success_without_data() {
        let backend = FakeBackend::new();
        let post = backend.seed_post(4, false);
        let gateway = Gateway::new(backend);

        let first = gateway.like_post(post).await;
        assert_eq!(first.data, Some(ToggleResult { active: true, count: 5 }));

        let second = gateway.like_post(post).await;
        assert!(second.success);
        assert_eq!(second.data, None);
        assert_eq!(second.error, None);
    }

    #[tokio::test]
    async fn test_failures_become_display_messages() {
        let backend = FakeBackend::new();
        let post = backend.seed_post(0, false);
        backend.fail_next(BackendError::Transport("connection reset".into()));
        let gateway = Gateway::new(backend);

        let envelope = gateway.toggle_like(post).await;
        assert!(!envelope.success);
        assert_eq!(
            envelope.error.as_deref(),
            Some("Something went wrong. Please try again.")
        );
    }

    #[tokio::test]
    async fn test_duplicate_outside_unique_inserts_is_a_failure() {
        let backend = FakeBackend::new();
        let post = backend.seed_post(0, false);
        backend.fail_next(BackendError::Duplicate);
        let gateway = Gateway::new(backend);

        let envelope = gateway.share_post(post).await;
        assert!(!envelope.success);
        assert_eq!(envelope.error.as_deref(), Some("That already exists"));
    }

    #[tokio::test]
    async fn test_duplicate_comment_like_is_absorbed() {
        let backend = FakeBackend::new();
        backend.fail_next(BackendError::Duplicate);
        let gateway = Gateway::new(backend);

        let envelope = gateway.toggle_comment_like(Uuid::new_v4()).await;
        assert!(envelope.success);
        assert_eq!(envelope.data, None);
    }

    #[test]
    fn test_validation_text_passes_through() {
        let envelope = settle::<()>(
            "add_comment",
            Err(BackendError::Validation("Comment cannot be empty".into())),
        );
        assert_eq!(envelope.error.as_deref(), Some("Comment cannot be empty"));
    }
}
