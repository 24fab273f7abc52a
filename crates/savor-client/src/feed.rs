use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use savor_types::events::{ChangeFilter, tables};
use savor_types::models::Post;

use crate::gateway::{Backend, Gateway};
use crate::realtime::Reloader;
use crate::social::PostInteractions;
use crate::upload::{Bucket, MediaFile, Uploader};

pub const PAGE_SIZE: u32 = 10;
pub const MAX_CAPTION_LEN: usize = 2200;

#[derive(Default)]
struct FeedState {
    posts: Vec<Post>,
    cursor: Option<DateTime<Utc>>,
    exhausted: bool,
}

/// The home feed, newest first, paged by `created_at`.
pub struct FeedStore<B> {
    gateway: Gateway<B>,
    interactions: Arc<PostInteractions<B>>,
    state: Mutex<FeedState>,
}

impl<B: Backend> FeedStore<B> {
    pub fn new(gateway: Gateway<B>, interactions: Arc<PostInteractions<B>>) -> Self {
        Self {
            gateway,
            interactions,
            state: Mutex::new(FeedState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn filter(&self) -> ChangeFilter {
        ChangeFilter::table(tables::POSTS)
    }

    /// Posts as displayed, with pending likes and shares applied.
    pub fn posts(&self) -> Vec<Post> {
        self.state()
            .posts
            .iter()
            .map(|p| self.interactions.project(p))
            .collect()
    }

    pub fn has_more(&self) -> bool {
        !self.state().exhausted
    }

    /// Reloads the first page, dropping anything paged in before.
    pub async fn refresh(&self) -> Result<(), String> {
        let page = self.fetch().await?;
        self.commit(page);
        Ok(())
    }

    /// Appends the next page. A no-op once the feed is exhausted.
    pub async fn load_more(&self) -> Result<usize, String> {
        let cursor = {
            let state = self.state();
            if state.exhausted {
                return Ok(0);
            }
            state.cursor
        };
        let page = self
            .gateway
            .fetch_feed(cursor, PAGE_SIZE)
            .await
            .into_result()?
            .unwrap_or_default();

        let mut state = self.state();
        if state.cursor != cursor {
            debug!("Feed refreshed while paging, dropping stale page");
            return Ok(0);
        }
        let mut added = 0;
        for post in page.posts {
            if state.posts.iter().any(|p| p.id == post.id) {
                continue;
            }
            self.interactions.seed_post(&post);
            state.posts.push(post);
            added += 1;
        }
        state.exhausted = page.next_cursor.is_none();
        state.cursor = page.next_cursor;
        Ok(added)
    }

    /// Publishes a post, uploading its media first when there is any.
    pub async fn publish(&self, caption: &str, media: Option<MediaFile>) -> Result<Post, String> {
        let caption = caption.trim().to_string();
        if caption.chars().count() > MAX_CAPTION_LEN {
            return Err(format!("Caption cannot exceed {MAX_CAPTION_LEN} characters"));
        }

        let media_path = match media {
            Some(file) => {
                let uploaded = Uploader::new(self.gateway.clone())
                    .upload(Bucket::Media, file)
                    .await
                    .into_result()?
                    .ok_or_else(|| "Upload failed".to_string())?;
                Some(uploaded.path)
            }
            None => None,
        };

        let post = self
            .gateway
            .create_post(caption, media_path)
            .await
            .into_result()?
            .ok_or_else(|| "Post was not saved".to_string())?;
        info!("Published post {}", post.id);

        self.interactions.seed_post(&post);
        let mut state = self.state();
        if !state.posts.iter().any(|p| p.id == post.id) {
            state.posts.insert(0, post.clone());
        }
        Ok(post)
    }
}

impl<B: Backend> Reloader for FeedStore<B> {
    type State = savor_types::api::FeedPage;

    async fn fetch(&self) -> Result<Self::State, String> {
        Ok(self
            .gateway
            .fetch_feed(None, PAGE_SIZE)
            .await
            .into_result()?
            .unwrap_or_default())
    }

    fn commit(&self, page: Self::State) {
        for post in &page.posts {
            self.interactions.seed_post(post);
        }
        let mut state = self.state();
        state.exhausted = page.next_cursor.is_none();
        state.cursor = page.next_cursor;
        state.posts = page.posts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    fn store(posts: usize) -> (FeedStore<FakeBackend>, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::new());
        for _ in 0..posts {
            backend.seed_post(0, false);
        }
        let gateway = Gateway::from_shared(Arc::clone(&backend));
        let interactions = Arc::new(PostInteractions::new(gateway.clone()));
        (FeedStore::new(gateway, interactions), backend)
    }

    #[tokio::test]
    async fn test_pages_until_exhausted() {
        let (feed, _) = store(25);
        feed.refresh().await.unwrap();
        assert_eq!(feed.posts().len(), 10);
        assert!(feed.has_more());

        assert_eq!(feed.load_more().await, Ok(10));
        assert_eq!(feed.load_more().await, Ok(5));
        assert!(!feed.has_more());
        assert_eq!(feed.load_more().await, Ok(0));

        let posts = feed.posts();
        assert_eq!(posts.len(), 25);
        assert!(posts.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn test_like_shows_in_feed_before_reload() {
        let (feed, backend) = store(3);
        feed.refresh().await.unwrap();
        let target = feed.posts()[1].id;

        feed.interactions.toggle_like(target).await;
        let shown = feed.posts().into_iter().find(|p| p.id == target).unwrap();
        assert!(shown.user_has_liked);
        assert_eq!(shown.likes_count, 1);
        assert_eq!(backend.post(target).likes_count, 1);
    }

    #[tokio::test]
    async fn test_publish_with_media() {
        let (feed, backend) = store(1);
        feed.refresh().await.unwrap();

        let post = feed
            .publish("Sunday roast", Some(MediaFile::new("roast.jpg", "image/jpeg", vec![7u8; 32])))
            .await
            .unwrap();
        assert_eq!(post.media_path, backend.uploads().first().cloned());
        assert_eq!(feed.posts()[0].id, post.id);

        let err = feed
            .publish("Sunday roast", Some(MediaFile::new("roast.bmp", "image/bmp", vec![7u8; 32])))
            .await
            .unwrap_err();
        assert_eq!(err, "This file type is not supported");
        assert_eq!(backend.uploads().len(), 1);
    }
}
