use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use savor_types::api::Claims;
use savor_types::events::{RealtimeCommand, RealtimeMessage};

use crate::hub::Hub;

/// Ping cadence. Two unanswered pings in a row close the socket.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How long a fresh socket may take to send its Identify command.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle one realtime websocket: Identify handshake, then per-subscription
/// forwarding of hub events until either side goes away.
pub async fn handle_connection(socket: WebSocket, hub: Hub, jwt_secret: String) {
    let (mut sender, mut receiver) = socket.split();

    let user_id = match wait_for_identify(&mut receiver, &jwt_secret).await {
        Some(id) => id,
        None => {
            warn!("Realtime client failed to identify, closing");
            return;
        }
    };

    info!("{} connected to realtime", user_id);

    if send_json(&mut sender, &RealtimeMessage::Ready { user_id }).await.is_err() {
        return;
    }

    // Everything bound for this client funnels through one queue so the
    // socket has a single writer.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<RealtimeMessage>();

    let alive = Arc::new(AtomicBool::new(true));
    let alive_send = alive.clone();
    let alive_recv = alive.clone();

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_pongs: u8 = 0;

        loop {
            tokio::select! {
                msg = out_rx.recv() => {
                    let Some(msg) = msg else { break };
                    if send_json(&mut sender, &msg).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if alive_send.swap(false, Ordering::Acquire) {
                        missed_pongs = 0;
                    } else {
                        missed_pongs += 1;
                        if missed_pongs >= 2 {
                            warn!("{} stopped answering pings, closing", user_id);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        let mut subscriptions: HashMap<u64, JoinHandle<()>> = HashMap::new();

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<RealtimeCommand>(&text) {
                    Ok(cmd) => handle_command(&hub, user_id, cmd, &out_tx, &mut subscriptions),
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            user_id,
                            e,
                            &text[..text.len().min(200)]
                        );
                        let _ = out_tx.send(RealtimeMessage::Error {
                            message: "Unrecognised command".to_string(),
                        });
                    }
                },
                Message::Pong(_) => {
                    alive_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        for (_, task) in subscriptions.drain() {
            task.abort();
        }
    });

    // Whichever side stops first takes the other down
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} disconnected from realtime", user_id);
}

fn handle_command(
    hub: &Hub,
    user_id: Uuid,
    cmd: RealtimeCommand,
    out_tx: &mpsc::UnboundedSender<RealtimeMessage>,
    subscriptions: &mut HashMap<u64, JoinHandle<()>>,
) {
    match cmd {
        RealtimeCommand::Identify { .. } => {} // Already handled

        RealtimeCommand::Subscribe {
            subscription,
            filter,
        } => {
            debug!("{} subscribing #{} to {:?}", user_id, subscription, filter);
            let mut stream = hub.watch(filter);
            let out_tx = out_tx.clone();
            let task = tokio::spawn(async move {
                while let Some(event) = stream.next().await {
                    if out_tx
                        .send(RealtimeMessage::Change {
                            subscription,
                            event,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            });
            // Re-using an id replaces the old subscription.
            if let Some(previous) = subscriptions.insert(subscription, task) {
                previous.abort();
            }
        }

        RealtimeCommand::Unsubscribe { subscription } => {
            debug!("{} unsubscribing #{}", user_id, subscription);
            if let Some(task) = subscriptions.remove(&subscription) {
                task.abort();
            }
        }
    }
}

async fn send_json(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    msg: &RealtimeMessage,
) -> Result<(), ()> {
    let text = serde_json::to_string(msg).map_err(|e| warn!("Unserializable frame: {}", e))?;
    sender
        .send(Message::Text(text.into()))
        .await
        .map_err(|_| ())
}

async fn wait_for_identify(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<Uuid> {
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(RealtimeCommand::Identify { token }) =
                    serde_json::from_str::<RealtimeCommand>(&text)
                {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some(token_data.claims.sub);
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}
