use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use savor_types::events::{ChangeEvent, ChangeFilter};

use crate::source::{ChangeSource, ChangeStream};

/// Fans row-change events out to every matching subscription.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    /// Every published change goes through here; subscriptions filter their copy
    broadcast_tx: broadcast::Sender<ChangeEvent>,

    /// Live subscriptions, for diagnostics
    active: AtomicUsize,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(HubInner {
                broadcast_tx,
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Publish a change to every subscriber whose filter matches it.
    pub fn publish(&self, event: ChangeEvent) {
        debug!("{:?} on {}", event.kind, event.table);
        let _ = self.inner.broadcast_tx.send(event);
    }

    /// Number of subscriptions currently forwarding events.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Open a filtered subscription. Events published after this call that
    /// match `filter` are delivered in publish order.
    pub fn watch(&self, filter: ChangeFilter) -> ChangeStream {
        let mut broadcast_rx = self.inner.broadcast_tx.subscribe();
        let (tx, stream) = ChangeStream::channel();
        let inner = self.inner.clone();
        inner.active.fetch_add(1, Ordering::AcqRel);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = broadcast_rx.recv() => {
                        let event = match result {
                            Ok(event) => event,
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Subscription on {} lagged by {} events", filter.table, n);
                                continue;
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        };
                        if filter.matches(&event) && tx.send(event).is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            inner.active.fetch_sub(1, Ordering::AcqRel);
        });

        stream
    }
}

impl ChangeSource for Hub {
    async fn subscribe(&self, filter: ChangeFilter) -> anyhow::Result<ChangeStream> {
        Ok(self.watch(filter))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use savor_types::events::ChangeKind;

    use super::*;

    fn comment_on(post_id: &str) -> ChangeEvent {
        ChangeEvent::new(
            "comments",
            ChangeKind::Insert,
            serde_json::json!({ "id": "c", "post_id": post_id }),
        )
    }

    #[tokio::test]
    async fn test_only_matching_events_are_delivered() {
        let hub = Hub::new();
        let mut p1 = hub.watch(ChangeFilter::eq("comments", "post_id", "p1"));
        let mut p2 = hub.watch(ChangeFilter::eq("comments", "post_id", "p2"));

        hub.publish(comment_on("p1"));

        let event = tokio::time::timeout(Duration::from_secs(1), p1.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.record["post_id"], "p1");
        assert!(
            tokio::time::timeout(Duration::from_millis(50), p2.next())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_subscription() {
        let hub = Hub::new();
        let stream = hub.watch(ChangeFilter::table("comments"));
        assert_eq!(hub.active_subscriptions(), 1);

        drop(stream);
        for _ in 0..50 {
            if hub.active_subscriptions() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.active_subscriptions(), 0);
    }
}
