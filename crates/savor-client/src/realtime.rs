//! Keeps screens in sync with backend changes.
//!
//! A mounted [`SubscriptionListener`] watches one filter and, on every
//! matching change, refetches the screen's data through its [`Reloader`].
//! Events are only a trigger: their payload is never merged into local state.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use savor_realtime::{ChangeSource, ChangeStream};
use savor_types::events::ChangeFilter;

/// A screen's data that can be refetched in full.
pub trait Reloader: Send + Sync + 'static {
    type State: Send + 'static;

    fn fetch(&self) -> impl Future<Output = Result<Self::State, String>> + Send;

    /// Replaces the displayed data with a fetched snapshot.
    fn commit(&self, state: Self::State);
}

struct Mounted {
    filter: ChangeFilter,
    /// Cancelled on unmount. Reloads check it before committing, so nothing
    /// reaches the screen after teardown.
    token: CancellationToken,
    pump: JoinHandle<()>,
}

/// One live subscription, owned by a screen.
///
/// Reloads triggered by overlapping events run concurrently and whichever
/// finishes last wins.
pub struct SubscriptionListener<S> {
    source: Arc<S>,
    parent: CancellationToken,
    mounted: Option<Mounted>,
}

impl<S: ChangeSource> SubscriptionListener<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self::with_parent(source, CancellationToken::new())
    }

    /// A listener that is also torn down when `parent` is cancelled.
    pub fn with_parent(source: Arc<S>, parent: CancellationToken) -> Self {
        Self {
            source,
            parent,
            mounted: None,
        }
    }

    /// Subscribes to `filter`, replacing any previous subscription.
    pub async fn mount<R: Reloader>(&mut self, filter: ChangeFilter, reloader: Arc<R>) -> anyhow::Result<()> {
        self.unmount();

        let stream = self.source.subscribe(filter.clone()).await?;
        let token = self.parent.child_token();
        let pump = tokio::spawn(pump(stream, reloader, token.clone(), filter.clone()));
        info!("Listening for {} changes", filter.table);

        self.mounted = Some(Mounted { filter, token, pump });
        Ok(())
    }

    pub fn unmount(&mut self) {
        if let Some(mounted) = self.mounted.take() {
            debug!("Unsubscribing from {}", mounted.filter.table);
            mounted.token.cancel();
            mounted.pump.abort();
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
            .as_ref()
            .is_some_and(|m| !m.token.is_cancelled() && !m.pump.is_finished())
    }

    pub fn filter(&self) -> Option<&ChangeFilter> {
        self.mounted.as_ref().map(|m| &m.filter)
    }
}

impl<S> Drop for SubscriptionListener<S> {
    fn drop(&mut self) {
        if let Some(mounted) = self.mounted.take() {
            mounted.token.cancel();
            mounted.pump.abort();
        }
    }
}

async fn pump<R: Reloader>(mut stream: ChangeStream, reloader: Arc<R>, token: CancellationToken, filter: ChangeFilter) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = stream.next() => event,
        };
        let Some(event) = event else {
            warn!("Change stream for {} ended", filter.table);
            break;
        };
        debug!("{:?} on {}, reloading", event.kind, event.table);

        let reloader = Arc::clone(&reloader);
        let token = token.clone();
        tokio::spawn(async move {
            match reloader.fetch().await {
                Ok(state) if !token.is_cancelled() => reloader.commit(state),
                Ok(_) => debug!("Reload finished after unmount, discarding"),
                Err(e) => warn!("Reload failed: {}", e),
            }
        });
    }
    // Dropping the stream ends the subscription at the source
    drop(stream);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Notify;

    use savor_realtime::Hub;
    use savor_types::events::{ChangeEvent, ChangeKind, tables};

    use super::*;

    #[derive(Default)]
    struct Counter {
        fetches: AtomicUsize,
        commits: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl Reloader for Counter {
        type State = usize;

        async fn fetch(&self) -> Result<usize, String> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(self.fetches.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn commit(&self, _: usize) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn comment_on(post: &str) -> ChangeEvent {
        ChangeEvent::new(tables::COMMENTS, ChangeKind::Insert, json!({ "post_id": post }))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_matching_change_triggers_reload() {
        let hub = Arc::new(Hub::new());
        let counter = Arc::new(Counter::default());
        let mut listener = SubscriptionListener::new(Arc::clone(&hub));
        listener
            .mount(ChangeFilter::eq(tables::COMMENTS, "post_id", "p1"), Arc::clone(&counter))
            .await
            .unwrap();
        assert!(listener.is_mounted());

        hub.publish(comment_on("p2"));
        hub.publish(comment_on("p1"));
        settle().await;

        assert_eq!(counter.commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_commit_after_unmount() {
        let hub = Arc::new(Hub::new());
        let gate = Arc::new(Notify::new());
        let counter = Arc::new(Counter {
            gate: Some(Arc::clone(&gate)),
            ..Counter::default()
        });
        let mut listener = SubscriptionListener::new(Arc::clone(&hub));
        listener
            .mount(ChangeFilter::table(tables::COMMENTS), Arc::clone(&counter))
            .await
            .unwrap();

        // A reload is underway when the screen goes away
        hub.publish(comment_on("p1"));
        settle().await;
        listener.unmount();
        gate.notify_waiters();
        settle().await;

        // Later events find nobody listening
        hub.publish(comment_on("p1"));
        gate.notify_waiters();
        settle().await;

        assert_eq!(counter.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(counter.commits.load(Ordering::SeqCst), 0);
        assert_eq!(hub.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_remount_replaces_subscription() {
        let hub = Arc::new(Hub::new());
        let counter = Arc::new(Counter::default());
        let mut listener = SubscriptionListener::new(Arc::clone(&hub));

        listener
            .mount(ChangeFilter::eq(tables::COMMENTS, "post_id", "p1"), Arc::clone(&counter))
            .await
            .unwrap();
        listener
            .mount(ChangeFilter::eq(tables::COMMENTS, "post_id", "p2"), Arc::clone(&counter))
            .await
            .unwrap();
        settle().await;
        assert_eq!(hub.active_subscriptions(), 1);

        hub.publish(comment_on("p1"));
        settle().await;
        assert_eq!(counter.commits.load(Ordering::SeqCst), 0);

        hub.publish(comment_on("p2"));
        settle().await;
        assert_eq!(counter.commits.load(Ordering::SeqCst), 1);
        assert_eq!(listener.filter().and_then(|f| f.value.clone()).as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_parent_cancellation_tears_down() {
        let hub = Arc::new(Hub::new());
        let parent = CancellationToken::new();
        let counter = Arc::new(Counter::default());
        let mut listener = SubscriptionListener::with_parent(Arc::clone(&hub), parent.clone());
        listener
            .mount(ChangeFilter::table(tables::COMMENTS), Arc::clone(&counter))
            .await
            .unwrap();

        parent.cancel();
        settle().await;
        assert!(!listener.is_mounted());

        hub.publish(comment_on("p1"));
        settle().await;
        assert_eq!(counter.commits.load(Ordering::SeqCst), 0);
    }
}
