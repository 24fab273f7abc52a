use std::future::Future;

use tokio::sync::mpsc;

use savor_types::events::{ChangeEvent, ChangeFilter};

/// Anything that can hand out a stream of change notifications for a filter.
///
/// The in-process [`crate::Hub`] implements it for the backend and for tests;
/// the client implements it over the realtime websocket.
pub trait ChangeSource: Send + Sync + 'static {
    fn subscribe(
        &self,
        filter: ChangeFilter,
    ) -> impl Future<Output = anyhow::Result<ChangeStream>> + Send;
}

/// Receiving half of one subscription. Dropping it ends the subscription.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeStream {
    /// A connected sender/stream pair. Events pushed into the sender come
    /// out of the stream in order.
    pub fn channel() -> (mpsc::UnboundedSender<ChangeEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next event, or `None` once the producing side has gone away.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}
