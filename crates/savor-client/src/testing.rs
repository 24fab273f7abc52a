//! In-memory [`Backend`] for unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use savor_types::api::{FeedPage, ShareResult, ToggleResult, UploadResponse};
use savor_types::models::{CommentNode, Conversation, DevicePlatform, Message, MessagePreview, Participant, Post};

use crate::error::BackendError;
use crate::gateway::Backend;

#[derive(Default)]
struct State {
    posts: Vec<Post>,
    liked: HashSet<Uuid>,
    comments: Vec<CommentNode>,
    comment_likes: HashSet<Uuid>,
    /// (follower, followee)
    follows: HashSet<(Uuid, Uuid)>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    devices: HashSet<String>,
    uploads: Vec<String>,
}

pub struct FakeBackend {
    viewer: Uuid,
    state: Mutex<State>,
    failures: Mutex<VecDeque<BackendError>>,
    gate: tokio::sync::Mutex<()>,
    calls: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            viewer: Uuid::new_v4(),
            state: Mutex::new(State::default()),
            failures: Mutex::new(VecDeque::new()),
            gate: tokio::sync::Mutex::new(()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn viewer(&self) -> Uuid {
        self.viewer
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Makes the next backend call fail with `err`.
    pub fn fail_next(&self, err: BackendError) {
        self.failures.lock().unwrap().push_back(err);
    }

    /// Calls block until the returned guard is dropped.
    pub async fn hold(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn begin(&self) -> Result<(), BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        drop(self.gate.lock().await);
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // -- Seeding --

    pub fn seed_post(&self, likes: u32, liked: bool) -> Uuid {
        let mut state = self.state();
        let created_at = Utc::now() - Duration::minutes(state.posts.len() as i64);
        let post = Post {
            id: Uuid::new_v4(),
            author_id: Uuid::new_v4(),
            author_username: "chef".to_string(),
            caption: format!("dish #{}", state.posts.len() + 1),
            media_path: None,
            likes_count: likes,
            comments_count: 0,
            shares_count: 0,
            user_has_liked: false,
            created_at,
        };
        let id = post.id;
        if liked {
            state.liked.insert(id);
        }
        state.posts.push(post);
        id
    }

    pub fn post(&self, id: Uuid) -> Post {
        let state = self.state();
        view_post(&state, id).unwrap()
    }

    /// A like made elsewhere, which the client has not seen.
    pub fn record_like(&self, post_id: Uuid) {
        let mut state = self.state();
        if state.liked.insert(post_id) {
            if let Some(post) = state.posts.iter_mut().find(|p| p.id == post_id) {
                post.likes_count += 1;
            }
        }
    }

    pub fn followers(&self, user_id: Uuid) -> u32 {
        self.state().follows.iter().filter(|(_, followee)| *followee == user_id).count() as u32
    }

    /// A message from `sender` arriving in a conversation.
    pub fn deliver(&self, conversation_id: Uuid, sender: Uuid, body: &str) -> Message {
        push_message(&mut self.state(), conversation_id, sender, body.to_string())
    }

    pub fn devices(&self) -> usize {
        self.state().devices.len()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state().uploads.clone()
    }
}

fn view_post(state: &State, id: Uuid) -> Option<Post> {
    state.posts.iter().find(|p| p.id == id).map(|p| Post {
        user_has_liked: state.liked.contains(&id),
        comments_count: state.comments.iter().filter(|c| c.post_id == id && !c.is_deleted).count() as u32,
        ..p.clone()
    })
}

fn push_message(state: &mut State, conversation_id: Uuid, sender: Uuid, body: String) -> Message {
    let message = Message {
        id: Uuid::new_v4(),
        conversation_id,
        sender_id: sender,
        body,
        created_at: Utc::now(),
        delivered_at: None,
        read_at: None,
    };
    if let Some(conv) = state.conversations.iter_mut().find(|c| c.id == conversation_id) {
        for p in conv.participants.iter_mut().filter(|p| p.user_id != sender) {
            p.unread_count += 1;
        }
        conv.last_message = Some(MessagePreview {
            message_id: message.id,
            sender_id: sender,
            body: message.body.clone(),
            created_at: message.created_at,
        });
        conv.updated_at = message.created_at;
    }
    state.messages.push(message.clone());
    message
}

fn toggle(set: &mut HashSet<Uuid>, id: Uuid, count: &mut u32) -> bool {
    if set.remove(&id) {
        *count = count.saturating_sub(1);
        false
    } else {
        set.insert(id);
        *count += 1;
        true
    }
}

impl Backend for FakeBackend {
    async fn fetch_feed(&self, before: Option<DateTime<Utc>>, limit: u32) -> Result<FeedPage, BackendError> {
        self.begin().await?;
        let state = self.state();
        let mut ids: Vec<(DateTime<Utc>, Uuid)> = state
            .posts
            .iter()
            .filter(|p| before.is_none_or(|b| p.created_at < b))
            .map(|p| (p.created_at, p.id))
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0));
        let posts: Vec<Post> = ids
            .into_iter()
            .take(limit as usize)
            .filter_map(|(_, id)| view_post(&state, id))
            .collect();
        let next_cursor = (posts.len() == limit as usize)
            .then(|| posts.last().map(|p| p.created_at))
            .flatten();
        Ok(FeedPage { posts, next_cursor })
    }

    async fn fetch_post(&self, post_id: Uuid) -> Result<Post, BackendError> {
        self.begin().await?;
        view_post(&self.state(), post_id).ok_or_else(|| BackendError::NotFound("Post".into()))
    }

    async fn create_post(&self, caption: String, media_path: Option<String>) -> Result<Post, BackendError> {
        self.begin().await?;
        let post = Post {
            id: Uuid::new_v4(),
            author_id: self.viewer,
            author_username: "me".to_string(),
            caption,
            media_path,
            likes_count: 0,
            comments_count: 0,
            shares_count: 0,
            user_has_liked: false,
            created_at: Utc::now(),
        };
        self.state().posts.push(post.clone());
        Ok(post)
    }

    async fn like_post(&self, post_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.begin().await?;
        let mut state = self.state();
        if !state.liked.insert(post_id) {
            return Err(BackendError::Duplicate);
        }
        let post = state.posts.iter_mut().find(|p| p.id == post_id).ok_or(BackendError::NotFound("Post".into()))?;
        post.likes_count += 1;
        Ok(ToggleResult { active: true, count: post.likes_count })
    }

    async fn unlike_post(&self, post_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.begin().await?;
        let mut state = self.state();
        let removed = state.liked.remove(&post_id);
        let post = state.posts.iter_mut().find(|p| p.id == post_id).ok_or(BackendError::NotFound("Post".into()))?;
        if removed {
            post.likes_count = post.likes_count.saturating_sub(1);
        }
        Ok(ToggleResult { active: false, count: post.likes_count })
    }

    async fn toggle_like(&self, post_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.begin().await?;
        let mut guard = self.state();
        let state = &mut *guard;
        let post = state.posts.iter_mut().find(|p| p.id == post_id).ok_or(BackendError::NotFound("Post".into()))?;
        let active = toggle(&mut state.liked, post_id, &mut post.likes_count);
        Ok(ToggleResult { active, count: post.likes_count })
    }

    async fn share_post(&self, post_id: Uuid) -> Result<ShareResult, BackendError> {
        self.begin().await?;
        let mut state = self.state();
        let post = state.posts.iter_mut().find(|p| p.id == post_id).ok_or(BackendError::NotFound("Post".into()))?;
        post.shares_count += 1;
        Ok(ShareResult { shares_count: post.shares_count })
    }

    async fn fetch_comments(&self, post_id: Uuid) -> Result<Vec<CommentNode>, BackendError> {
        self.begin().await?;
        let state = self.state();
        Ok(state
            .comments
            .iter()
            .filter(|c| c.post_id == post_id)
            .map(|c| CommentNode {
                user_has_liked: state.comment_likes.contains(&c.id),
                ..c.clone()
            })
            .collect())
    }

    async fn add_comment(
        &self,
        post_id: Uuid,
        content: String,
        parent_id: Option<Uuid>,
    ) -> Result<CommentNode, BackendError> {
        self.begin().await?;
        let mut state = self.state();
        if let Some(parent) = parent_id {
            if !state.comments.iter().any(|c| c.id == parent && c.post_id == post_id) {
                return Err(BackendError::NotFound("Comment".into()));
            }
        }
        let comment = CommentNode {
            id: Uuid::new_v4(),
            post_id,
            author_id: self.viewer,
            author_username: "me".to_string(),
            parent_id,
            content,
            like_count: 0,
            user_has_liked: false,
            is_deleted: false,
            created_at: Utc::now(),
            replies: Vec::new(),
        };
        state.comments.push(comment.clone());
        Ok(comment)
    }

    async fn toggle_comment_like(&self, comment_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.begin().await?;
        let mut guard = self.state();
        let state = &mut *guard;
        let comment = state
            .comments
            .iter_mut()
            .find(|c| c.id == comment_id)
            .ok_or(BackendError::NotFound("Comment".into()))?;
        let active = toggle(&mut state.comment_likes, comment_id, &mut comment.like_count);
        Ok(ToggleResult { active, count: comment.like_count })
    }

    async fn delete_comment(&self, comment_id: Uuid) -> Result<Uuid, BackendError> {
        self.begin().await?;
        let mut state = self.state();
        let comment = state
            .comments
            .iter_mut()
            .find(|c| c.id == comment_id && !c.is_deleted)
            .ok_or(BackendError::NotFound("Comment".into()))?;
        if comment.author_id != self.viewer {
            return Err(BackendError::Forbidden);
        }
        comment.is_deleted = true;
        comment.content.clear();
        Ok(comment_id)
    }

    async fn follow_user(&self, user_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.begin().await?;
        if !self.state().follows.insert((self.viewer, user_id)) {
            return Err(BackendError::Duplicate);
        }
        Ok(ToggleResult { active: true, count: self.followers(user_id) })
    }

    async fn unfollow_user(&self, user_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.begin().await?;
        self.state().follows.remove(&(self.viewer, user_id));
        Ok(ToggleResult { active: false, count: self.followers(user_id) })
    }

    async fn follow_status(&self, user_id: Uuid) -> Result<ToggleResult, BackendError> {
        self.begin().await?;
        let active = self.state().follows.contains(&(self.viewer, user_id));
        Ok(ToggleResult { active, count: self.followers(user_id) })
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, BackendError> {
        self.begin().await?;
        let mut conversations = self.state().conversations.clone();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn open_conversation(&self, with_user_id: Uuid) -> Result<Conversation, BackendError> {
        self.begin().await?;
        let mut state = self.state();
        let existing = state.conversations.iter().find(|c| {
            c.participants.len() == 2 && c.participants.iter().any(|p| p.user_id == with_user_id)
        });
        if let Some(conv) = existing {
            return Ok(conv.clone());
        }
        let participant = |user_id, username: &str| Participant {
            user_id,
            username: username.to_string(),
            unread_count: 0,
        };
        let conv = Conversation {
            id: Uuid::new_v4(),
            participants: vec![participant(self.viewer, "me"), participant(with_user_id, "friend")],
            last_message: None,
            updated_at: Utc::now(),
        };
        state.conversations.push(conv.clone());
        Ok(conv)
    }

    async fn list_messages(&self, conversation_id: Uuid, limit: u32) -> Result<Vec<Message>, BackendError> {
        self.begin().await?;
        let state = self.state();
        let all: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        let skip = all.len().saturating_sub(limit as usize);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn send_message(&self, conversation_id: Uuid, body: String) -> Result<Message, BackendError> {
        self.begin().await?;
        let mut state = self.state();
        if !state.conversations.iter().any(|c| c.id == conversation_id) {
            return Err(BackendError::NotFound("Conversation".into()));
        }
        Ok(push_message(&mut state, conversation_id, self.viewer, body))
    }

    async fn mark_read(&self, conversation_id: Uuid) -> Result<usize, BackendError> {
        self.begin().await?;
        let mut guard = self.state();
        let state = &mut *guard;
        let now = Utc::now();
        let mut marked = 0;
        for m in state
            .messages
            .iter_mut()
            .filter(|m| m.conversation_id == conversation_id && m.sender_id != self.viewer && m.read_at.is_none())
        {
            m.read_at = Some(now);
            marked += 1;
        }
        if let Some(conv) = state.conversations.iter_mut().find(|c| c.id == conversation_id) {
            for p in conv.participants.iter_mut().filter(|p| p.user_id == self.viewer) {
                p.unread_count = 0;
            }
        }
        Ok(marked)
    }

    async fn register_device(&self, token: String, _platform: DevicePlatform) -> Result<bool, BackendError> {
        self.begin().await?;
        if !self.state().devices.insert(token) {
            return Err(BackendError::Duplicate);
        }
        Ok(true)
    }

    async fn unregister_device(&self, token: String) -> Result<bool, BackendError> {
        self.begin().await?;
        Ok(self.state().devices.remove(&token))
    }

    async fn upload(
        &self,
        bucket: String,
        file_name: String,
        _content_type: String,
        bytes: Bytes,
    ) -> Result<UploadResponse, BackendError> {
        self.begin().await?;
        let path = format!("{}/{}/{}", bucket, self.viewer, file_name);
        self.state().uploads.push(path.clone());
        Ok(UploadResponse {
            path,
            size: bytes.len() as u64,
        })
    }
}
