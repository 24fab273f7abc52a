use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};
use uuid::Uuid;

use savor_types::api::Envelope;
use savor_types::events::{ChangeFilter, tables};
use savor_types::models::CommentNode;

use crate::gateway::{Backend, Gateway};
use crate::realtime::Reloader;
use crate::reconciler::{MutationOutcome, OptimisticStore, ToggleState};

pub const MAX_COMMENT_LEN: usize = 2000;

pub type CommentTree = Vec<Arc<CommentNode>>;

/// Fields to overwrite on one comment. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommentPatch {
    pub content: Option<String>,
    pub like_count: Option<u32>,
    pub user_has_liked: Option<bool>,
    pub is_deleted: Option<bool>,
}

impl CommentPatch {
    pub fn likes(state: ToggleState) -> Self {
        Self {
            like_count: Some(state.count),
            user_has_liked: Some(state.active),
            ..Self::default()
        }
    }

    pub fn deleted() -> Self {
        Self {
            content: Some(String::new()),
            is_deleted: Some(true),
            ..Self::default()
        }
    }

    fn apply(&self, node: &CommentNode) -> CommentNode {
        let mut next = node.clone();
        if let Some(content) = &self.content {
            next.content = content.clone();
        }
        if let Some(like_count) = self.like_count {
            next.like_count = like_count;
        }
        if let Some(user_has_liked) = self.user_has_liked {
            next.user_has_liked = user_has_liked;
        }
        if let Some(is_deleted) = self.is_deleted {
            next.is_deleted = is_deleted;
        }
        next
    }
}

/// Returns a tree where the comment `id` has `patch` merged in.
///
/// Only the path from the root to the patched comment is rebuilt; every
/// other node is the same `Arc` as in `tree`. An unknown id yields a tree
/// whose nodes are all shared with the input.
pub fn update_comment(tree: &[Arc<CommentNode>], id: Uuid, patch: &CommentPatch) -> CommentTree {
    patched(tree, id, patch).unwrap_or_else(|| tree.to_vec())
}

fn patched(tree: &[Arc<CommentNode>], id: Uuid, patch: &CommentPatch) -> Option<CommentTree> {
    for (i, node) in tree.iter().enumerate() {
        let replacement = if node.id == id {
            Some(Arc::new(patch.apply(node)))
        } else {
            patched(&node.replies, id, patch).map(|replies| {
                let mut copy = (**node).clone();
                copy.replies = replies;
                Arc::new(copy)
            })
        };

        if let Some(replacement) = replacement {
            let mut next = tree.to_vec();
            next[i] = replacement;
            return Some(next);
        }
    }
    None
}

pub fn find_comment(tree: &[Arc<CommentNode>], id: Uuid) -> Option<&Arc<CommentNode>> {
    tree.iter().find_map(|node| {
        if node.id == id {
            Some(node)
        } else {
            find_comment(&node.replies, id)
        }
    })
}

/// Attaches `reply` under the top-level comment that holds `parent_id`.
/// Threads are one level deep, so a reply to a reply joins its root's
/// replies. `None` when the parent is not in the tree.
pub fn insert_reply(tree: &[Arc<CommentNode>], parent_id: Uuid, reply: CommentNode) -> Option<CommentTree> {
    let root = tree
        .iter()
        .position(|node| node.id == parent_id || find_comment(&node.replies, parent_id).is_some())?;

    let mut copy = (*tree[root]).clone();
    copy.replies.push(Arc::new(CommentNode {
        replies: Vec::new(),
        ..reply
    }));

    let mut next = tree.to_vec();
    next[root] = Arc::new(copy);
    Some(next)
}

/// Adds a top-level comment after the existing ones.
pub fn push_comment(tree: &[Arc<CommentNode>], comment: CommentNode) -> CommentTree {
    let mut next = Vec::with_capacity(tree.len() + 1);
    next.extend(tree.iter().cloned());
    next.push(Arc::new(comment));
    next
}

/// Groups a flat, oldest-first list into top-level comments with their
/// replies. Replies whose parent is itself a reply are attached to the
/// top-level ancestor; replies to unknown comments become top-level.
pub fn build_tree(flat: Vec<CommentNode>) -> CommentTree {
    let parents: HashMap<Uuid, Option<Uuid>> = flat.iter().map(|c| (c.id, c.parent_id)).collect();

    let root_of = |mut id: Uuid| {
        // Bounded walk so a malformed cycle cannot spin forever
        for _ in 0..parents.len() {
            match parents.get(&id).copied().flatten() {
                Some(parent) if parents.contains_key(&parent) => id = parent,
                _ => break,
            }
        }
        id
    };

    let mut roots: Vec<CommentNode> = Vec::new();
    let mut index: HashMap<Uuid, usize> = HashMap::new();
    let mut replies: Vec<(Uuid, CommentNode)> = Vec::new();

    for mut comment in flat {
        comment.replies.clear();
        let root = root_of(comment.id);
        if root == comment.id {
            index.insert(comment.id, roots.len());
            roots.push(comment);
        } else {
            replies.push((root, comment));
        }
    }

    for (root, reply) in replies {
        if let Some(&i) = index.get(&root) {
            roots[i].replies.push(Arc::new(reply));
        }
    }

    roots.into_iter().map(Arc::new).collect()
}

/// Validates comment text, returning it trimmed.
pub fn validate_comment(content: &str) -> Result<String, String> {
    let content = content.trim();
    if content.is_empty() {
        return Err("Comment cannot be empty".to_string());
    }
    if content.chars().count() > MAX_COMMENT_LEN {
        return Err(format!("Comment cannot exceed {MAX_COMMENT_LEN} characters"));
    }
    Ok(content.to_string())
}

/// The comment section of one post.
///
/// Holds the tree as loaded from the backend plus local edits. Comment likes
/// go through an optimistic store; posting and deleting wait for the backend.
pub struct CommentThread<B> {
    post_id: Uuid,
    gateway: Gateway<B>,
    tree: Mutex<CommentTree>,
    likes: OptimisticStore<Uuid, ToggleState>,
    last_error: Mutex<Option<String>>,
}

impl<B: Backend> CommentThread<B> {
    pub fn new(gateway: Gateway<B>, post_id: Uuid) -> Self {
        Self {
            post_id,
            gateway,
            tree: Mutex::new(Vec::new()),
            likes: OptimisticStore::new(),
            last_error: Mutex::new(None),
        }
    }

    pub fn post_id(&self) -> Uuid {
        self.post_id
    }

    /// Changes that should trigger a reload of this thread.
    pub fn filter(&self) -> ChangeFilter {
        ChangeFilter::eq(tables::COMMENTS, "post_id", self.post_id)
    }

    fn tree(&self) -> MutexGuard<'_, CommentTree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_error(&self, error: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }

    pub fn comments(&self) -> CommentTree {
        self.tree().clone()
    }

    pub fn comment_count(&self) -> usize {
        self.tree().iter().map(|c| 1 + c.replies.len()).sum()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .or_else(|| self.likes.last_error())
    }

    pub async fn load(&self) -> Result<(), String> {
        match self.fetch().await {
            Ok(tree) => {
                self.commit(tree);
                Ok(())
            }
            Err(e) => {
                self.set_error(Some(e.clone()));
                Err(e)
            }
        }
    }

    /// Posts a comment, or a reply when `parent_id` is set. Input is checked
    /// before anything is sent.
    pub async fn submit(&self, content: &str, parent_id: Option<Uuid>) -> Result<Arc<CommentNode>, String> {
        let content = match validate_comment(content) {
            Ok(content) => content,
            Err(e) => {
                self.set_error(Some(e.clone()));
                return Err(e);
            }
        };

        let created = match self
            .gateway
            .add_comment(self.post_id, content, parent_id)
            .await
            .into_result()
        {
            Ok(Some(comment)) => comment,
            Ok(None) => {
                let e = "Comment was not saved".to_string();
                self.set_error(Some(e.clone()));
                return Err(e);
            }
            Err(e) => {
                self.set_error(Some(e.clone()));
                return Err(e);
            }
        };
        self.set_error(None);

        let mut tree = self.tree();
        // A change event may have reloaded the thread already
        if let Some(existing) = find_comment(&tree, created.id) {
            return Ok(Arc::clone(existing));
        }
        let id = created.id;
        let next = match created.parent_id {
            Some(parent) => insert_reply(&tree, parent, created.clone()),
            None => None,
        }
        .unwrap_or_else(|| push_comment(&tree, created));
        *tree = next;
        debug!("Comment {} added to post {}", id, self.post_id);
        find_comment(&tree, id)
            .cloned()
            .ok_or_else(|| "Comment was not saved".to_string())
    }

    pub async fn toggle_like(&self, comment_id: Uuid) -> MutationOutcome<ToggleState> {
        let Some(current) = find_comment(&self.tree(), comment_id).map(|c| ToggleState::new(c.user_has_liked, c.like_count)) else {
            return MutationOutcome::Ignored;
        };
        self.likes.seed(comment_id, current);

        let gateway = self.gateway.clone();
        self.likes
            .mutate_observed(
                comment_id,
                |s| Some(s.toggled()),
                || async move {
                    gateway
                        .toggle_comment_like(comment_id)
                        .await
                        .map(ToggleState::from)
                },
                |state| {
                    let mut tree = self.tree();
                    *tree = update_comment(&tree, comment_id, &CommentPatch::likes(*state));
                },
            )
            .await
    }

    /// Soft-deletes one of the user's comments once the backend confirms.
    pub async fn delete(&self, comment_id: Uuid) -> Result<(), String> {
        match self.gateway.delete_comment(comment_id).await.into_result() {
            Ok(_) => {
                let mut tree = self.tree();
                *tree = update_comment(&tree, comment_id, &CommentPatch::deleted());
                info!("Comment {} deleted", comment_id);
                self.set_error(None);
                Ok(())
            }
            Err(e) => {
                self.set_error(Some(e.clone()));
                Err(e)
            }
        }
    }
}

impl<B: Backend> Reloader for CommentThread<B> {
    type State = CommentTree;

    async fn fetch(&self) -> Result<CommentTree, String> {
        let flat: Envelope<Vec<CommentNode>> = self.gateway.fetch_comments(self.post_id).await;
        flat.into_result().map(|comments| build_tree(comments.unwrap_or_default()))
    }

    fn commit(&self, tree: CommentTree) {
        // Comments with a like in flight keep their predicted state
        let mut tree = tree;
        for root in tree.clone() {
            for node in std::iter::once(&root).chain(root.replies.iter()) {
                let loaded = ToggleState::new(node.user_has_liked, node.like_count);
                if !self.likes.seed(node.id, loaded) {
                    let pending = self.likes.get(&node.id);
                    tree = update_comment(&tree, node.id, &CommentPatch::likes(pending));
                }
            }
        }
        *self.tree() = tree;
    }
}
