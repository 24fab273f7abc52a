use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use savor_realtime::{ChangeSource, ChangeStream};
use savor_types::events::{ChangeEvent, ChangeFilter, RealtimeCommand, RealtimeMessage};

const READY_TIMEOUT: Duration = Duration::from_secs(10);

type Routes = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<ChangeEvent>>>>;

struct Connection {
    commands: mpsc::UnboundedSender<RealtimeCommand>,
    routes: Routes,
    ended: CancellationToken,
    task: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !self.task.is_finished() && !self.commands.is_closed()
    }
}

/// [`ChangeSource`] over the backend's realtime websocket.
///
/// All subscriptions share one connection, opened on first use and reopened
/// by the next subscribe after it drops. Streams of a dropped connection end,
/// and their listeners stop until they are mounted again.
pub struct WsChangeSource {
    url: String,
    token: String,
    next_subscription: AtomicU64,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl WsChangeSource {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            next_subscription: AtomicU64::new(1),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Closes the socket. Every open stream ends.
    pub async fn close(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.task.abort();
            info!("Realtime connection closed");
        }
    }

    async fn connect(&self) -> anyhow::Result<Connection> {
        let (socket, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", self.url))?;
        let (mut sink, mut stream) = socket.split();

        let identify = serde_json::to_string(&RealtimeCommand::Identify {
            token: self.token.clone(),
        })?;
        sink.send(Message::Text(identify.into())).await?;

        let user_id = tokio::time::timeout(READY_TIMEOUT, wait_for_ready(&mut stream))
            .await
            .context("Timed out waiting for realtime handshake")??;
        info!("Realtime connected as {}", user_id);

        let (commands, mut command_rx) = mpsc::unbounded_channel::<RealtimeCommand>();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let task_routes = routes.clone();
        let ended = CancellationToken::new();
        let ended_on_exit = ended.clone();

        let task = tokio::spawn(async move {
            // Cancelled on return or abort, which releases every stream watcher
            let _ended = ended_on_exit.drop_guard();
            loop {
                tokio::select! {
                    cmd = command_rx.recv() => {
                        let Some(cmd) = cmd else { break };
                        let Ok(text) = serde_json::to_string(&cmd) else { continue };
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    frame = stream.next() => {
                        let text = match frame {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!("Realtime socket error: {}", e);
                                break;
                            }
                        };
                        match serde_json::from_str::<RealtimeMessage>(text.as_str()) {
                            Ok(RealtimeMessage::Change { subscription, event }) => {
                                route(&task_routes, subscription, event);
                            }
                            Ok(RealtimeMessage::Error { message }) => warn!("Realtime error: {}", message),
                            Ok(RealtimeMessage::Ready { .. }) => {}
                            Err(e) => debug!("Ignoring malformed realtime frame: {}", e),
                        }
                    }
                }
            }
            // Ends every stream still attached to this connection
            task_routes.lock().unwrap_or_else(|e| e.into_inner()).clear();
            info!("Realtime connection ended");
        });

        Ok(Connection {
            commands,
            routes,
            ended,
            task,
        })
    }
}

fn route(routes: &Routes, subscription: u64, event: ChangeEvent) {
    let routes = routes.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(tx) = routes.get(&subscription) {
        let _ = tx.send(event);
    }
}

/// Unsubscribes server-side as soon as the stream behind `tx` is dropped.
/// Gives up once the connection ends, so the stream can close with it.
fn watch_stream(conn: &Connection, subscription: u64, tx: mpsc::UnboundedSender<ChangeEvent>) {
    let commands = conn.commands.clone();
    let routes = conn.routes.clone();
    let ended = conn.ended.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tx.closed() => {
                routes.lock().unwrap_or_else(|e| e.into_inner()).remove(&subscription);
                debug!("Subscription {} dropped, unsubscribing", subscription);
                let _ = commands.send(RealtimeCommand::Unsubscribe { subscription });
            }
            _ = ended.cancelled() => {}
        }
    });
}

async fn wait_for_ready<S>(stream: &mut S) -> anyhow::Result<Uuid>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        let Message::Text(text) = frame? else { continue };
        match serde_json::from_str::<RealtimeMessage>(text.as_str())? {
            RealtimeMessage::Ready { user_id } => return Ok(user_id),
            RealtimeMessage::Error { message } => bail!("Realtime handshake rejected: {message}"),
            RealtimeMessage::Change { .. } => continue,
        }
    }
    bail!("Realtime connection closed during handshake")
}

impl ChangeSource for WsChangeSource {
    async fn subscribe(&self, filter: ChangeFilter) -> anyhow::Result<ChangeStream> {
        let mut guard = self.connection.lock().await;
        if !guard.as_ref().is_some_and(Connection::is_alive) {
            *guard = Some(self.connect().await?);
        }
        let Some(conn) = guard.as_ref() else {
            bail!("Realtime connection unavailable");
        };

        let subscription = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let (tx, stream) = ChangeStream::channel();
        conn.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(subscription, tx.clone());

        if conn
            .commands
            .send(RealtimeCommand::Subscribe {
                subscription,
                filter: filter.clone(),
            })
            .is_err()
        {
            bail!("Realtime connection closed");
        }
        watch_stream(conn, subscription, tx);
        debug!("Subscription {} on {}", subscription, filter.table);
        Ok(stream)
    }
}
