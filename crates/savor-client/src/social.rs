use tracing::info;
use uuid::Uuid;

use savor_types::models::Post;

use crate::gateway::{Backend, Gateway};
use crate::reconciler::{MutationOutcome, OptimisticStore, ToggleState};

/// Likes, shares and follows as the current user sees them.
///
/// Each action kind has its own store, so liking and sharing the same post
/// never block each other, while a second like of a post whose like is still
/// in flight is dropped.
pub struct PostInteractions<B> {
    gateway: Gateway<B>,
    likes: OptimisticStore<Uuid, ToggleState>,
    shares: OptimisticStore<Uuid, u32>,
    follows: OptimisticStore<Uuid, ToggleState>,
}

impl<B: Backend> PostInteractions<B> {
    pub fn new(gateway: Gateway<B>) -> Self {
        Self {
            gateway,
            likes: OptimisticStore::new(),
            shares: OptimisticStore::new(),
            follows: OptimisticStore::new(),
        }
    }

    /// Records counters loaded with a post.
    pub fn seed_post(&self, post: &Post) {
        self.likes
            .seed(post.id, ToggleState::new(post.user_has_liked, post.likes_count));
        self.shares.seed(post.id, post.shares_count);
    }

    /// `post` with the displayed like and share state applied.
    pub fn project(&self, post: &Post) -> Post {
        let mut post = post.clone();
        if self.likes.contains(&post.id) {
            let likes = self.likes.get(&post.id);
            post.user_has_liked = likes.active;
            post.likes_count = likes.count;
        }
        if self.shares.contains(&post.id) {
            post.shares_count = self.shares.get(&post.id);
        }
        post
    }

    pub fn like_state(&self, post_id: Uuid) -> ToggleState {
        self.likes.get(&post_id)
    }

    pub fn share_count(&self, post_id: Uuid) -> u32 {
        self.shares.get(&post_id)
    }

    pub fn follow_state(&self, user_id: Uuid) -> ToggleState {
        self.follows.get(&user_id)
    }

    /// Most recent rollback message across all actions, cleared on read.
    pub fn take_error(&self) -> Option<String> {
        self.likes
            .take_error()
            .or_else(|| self.shares.take_error())
            .or_else(|| self.follows.take_error())
    }

    // -- Likes --

    pub async fn toggle_like(&self, post_id: Uuid) -> MutationOutcome<ToggleState> {
        let gateway = self.gateway.clone();
        self.likes
            .mutate(
                post_id,
                |s| Some(s.toggled()),
                || async move { gateway.toggle_like(post_id).await.map(ToggleState::from) },
            )
            .await
    }

    /// Sets the like to `liked`. A repeated like the backend already has is
    /// taken as applied.
    pub async fn set_liked(&self, post_id: Uuid, liked: bool) -> MutationOutcome<ToggleState> {
        let gateway = self.gateway.clone();
        self.likes
            .mutate(
                post_id,
                |s| (s.active != liked).then(|| s.set(liked)),
                || async move {
                    let envelope = if liked {
                        gateway.like_post(post_id).await
                    } else {
                        gateway.unlike_post(post_id).await
                    };
                    envelope.map(ToggleState::from)
                },
            )
            .await
    }

    // -- Shares --

    /// Counts a share. Shares are not unique, so every call adds one.
    pub async fn share(&self, post_id: Uuid) -> MutationOutcome<u32> {
        let gateway = self.gateway.clone();
        let outcome = self
            .shares
            .mutate(
                post_id,
                |n| Some(n.saturating_add(1)),
                || async move { gateway.share_post(post_id).await.map(|r| r.shares_count) },
            )
            .await;
        if outcome.is_confirmed() {
            info!("Post {} shared", post_id);
        }
        outcome
    }

    // -- Follows --

    pub fn seed_follow(&self, user_id: Uuid, state: ToggleState) {
        self.follows.seed(user_id, state);
    }

    pub async fn load_follow(&self, user_id: Uuid) -> Result<ToggleState, String> {
        let state = self
            .gateway
            .follow_status(user_id)
            .await
            .into_result()?
            .map(ToggleState::from)
            .unwrap_or_default();
        self.follows.seed(user_id, state);
        Ok(self.follows.get(&user_id))
    }

    pub async fn toggle_follow(&self, user_id: Uuid) -> MutationOutcome<ToggleState> {
        let following = self.follows.get(&user_id).active;
        self.set_following(user_id, !following).await
    }

    pub async fn set_following(&self, user_id: Uuid, follow: bool) -> MutationOutcome<ToggleState> {
        let gateway = self.gateway.clone();
        self.follows
            .mutate(
                user_id,
                |s| (s.active != follow).then(|| s.set(follow)),
                || async move {
                    let envelope = if follow {
                        gateway.follow_user(user_id).await
                    } else {
                        gateway.unfollow_user(user_id).await
                    };
                    envelope.map(ToggleState::from)
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::BackendError;
    use crate::testing::FakeBackend;

    fn setup(likes: u32, liked: bool) -> (PostInteractions<FakeBackend>, Arc<FakeBackend>, Uuid) {
        let backend = Arc::new(FakeBackend::new());
        let post = backend.seed_post(likes, liked);
        let interactions = PostInteractions::new(Gateway::from_shared(Arc::clone(&backend)));
        interactions.seed_post(&backend.post(post));
        (interactions, backend, post)
    }

    #[tokio::test]
    async fn test_like_then_failed_unlike_restores() {
        let (interactions, backend, post) = setup(4, false);

        let outcome = interactions.toggle_like(post).await;
        assert_eq!(outcome, MutationOutcome::Confirmed(ToggleState::new(true, 5)));
        assert_eq!(interactions.like_state(post), ToggleState::new(true, 5));

        backend.fail_next(BackendError::Transport("offline".into()));
        let outcome = interactions.toggle_like(post).await;
        assert!(matches!(outcome, MutationOutcome::RolledBack { .. }));
        assert_eq!(interactions.like_state(post), ToggleState::new(true, 5));
        assert_eq!(
            interactions.take_error().as_deref(),
            Some("Something went wrong. Please try again.")
        );

        let outcome = interactions.toggle_like(post).await;
        assert_eq!(outcome, MutationOutcome::Confirmed(ToggleState::new(false, 4)));
    }

    #[tokio::test]
    async fn test_stale_like_is_absorbed() {
        // The backend already has the like, but this screen loaded before it
        let (interactions, backend, post) = setup(4, false);
        backend.record_like(post);

        let outcome = interactions.set_liked(post, true).await;
        assert_eq!(outcome, MutationOutcome::Confirmed(ToggleState::new(true, 5)));
        assert_eq!(interactions.take_error(), None);
        assert_eq!(backend.post(post).likes_count, 5);
    }

    #[tokio::test]
    async fn test_concurrent_like_is_ignored() {
        let (interactions, backend, post) = setup(4, false);
        let interactions = Arc::new(interactions);

        let held = backend.hold().await;
        let first = {
            let interactions = Arc::clone(&interactions);
            tokio::spawn(async move { interactions.toggle_like(post).await })
        };
        while backend.calls() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(interactions.toggle_like(post).await, MutationOutcome::Ignored);
        // Sharing the same post is a different action and goes through
        let shared = {
            let interactions = Arc::clone(&interactions);
            tokio::spawn(async move { interactions.share(post).await })
        };

        drop(held);
        assert!(first.await.unwrap().is_confirmed());
        assert_eq!(shared.await.unwrap(), MutationOutcome::Confirmed(1));
        assert_eq!(backend.post(post).likes_count, 5);
    }

    #[tokio::test]
    async fn test_projection_reflects_optimistic_state() {
        let (interactions, backend, post) = setup(2, false);
        interactions.toggle_like(post).await;
        interactions.share(post).await;

        let shown = interactions.project(&backend.post(post));
        assert!(shown.user_has_liked);
        assert_eq!(shown.likes_count, 3);
        assert_eq!(shown.shares_count, 1);
    }

    #[tokio::test]
    async fn test_follow_twice_stays_one_relationship() {
        let (interactions, backend, _) = setup(0, false);
        let chef = Uuid::new_v4();

        assert!(interactions.set_following(chef, true).await.is_confirmed());
        assert_eq!(interactions.set_following(chef, true).await, MutationOutcome::Ignored);

        // A second client follows again with stale state
        interactions.seed_follow(chef, ToggleState::new(false, 0));
        let outcome = interactions.set_following(chef, true).await;
        assert!(outcome.is_confirmed());
        assert_eq!(backend.followers(chef), 1);
        assert_eq!(interactions.load_follow(chef).await, Ok(ToggleState::new(true, 1)));
    }

    #[tokio::test]
    async fn test_unfollow_at_zero_clamps() {
        let (interactions, backend, _) = setup(0, false);
        let chef = Uuid::new_v4();
        interactions.seed_follow(chef, ToggleState::new(true, 0));

        backend.fail_next(BackendError::Server {
            status: 500,
            message: "boom".into(),
        });
        let outcome = interactions.toggle_follow(chef).await;
        assert_eq!(
            outcome,
            MutationOutcome::RolledBack {
                restored: ToggleState::new(true, 0),
                error: "Something went wrong. Please try again.".to_string(),
            }
        );
    }
}
