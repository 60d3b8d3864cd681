use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use parley_types::events::ClientSignal;

use crate::directory::{ConnectionHandle, PresenceDirectory};
use crate::router::{DeliveryRouter, EphemeralSignal};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// How much of a rejected raw payload makes it into the log.
const MAX_LOG_BYTES: usize = 200;

/// Truncate a raw payload for logging without splitting a multibyte
/// character. A straight byte slice panics mid-character, which would
/// tear down the session over a payload we only meant to drop.
fn log_preview(text: &str) -> &str {
    if text.len() <= MAX_LOG_BYTES {
        return text;
    }
    let mut end = MAX_LOG_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Drive one WebSocket session from accept to teardown.
///
/// The session owns a targeted-event channel registered with the
/// presence directory once the client announces an identity. Each
/// inbound signal is handled to completion before the next is read;
/// the only suspension points inside a handler are the best-effort
/// forwards themselves.
pub async fn handle_connection(socket: WebSocket, directory: PresenceDirectory) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut session_rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(tx);
    let conn_id = handle.conn_id();

    info!("session {} connected", conn_id);

    let mut broadcast_rx = directory.subscribe();
    let router = DeliveryRouter::new(directory.clone());
    let directory_recv = directory.clone();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward directory broadcasts + targeted events to the client,
    // with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to encode broadcast event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = session_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("failed to encode targeted event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
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

    // Read signals from the client.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientSignal>(&text) {
                    Ok(signal) => {
                        handle_signal(&directory_recv, &router, &handle, signal).await;
                    }
                    Err(e) => {
                        // Malformed payloads are rejected without
                        // touching directory state.
                        warn!(
                            "session {} bad signal: {} -- raw: {}",
                            conn_id,
                            e,
                            log_preview(&text)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Graceful or abrupt, teardown releases the presence record — but
    // only if this connection still owns its identity binding.
    directory.release(conn_id).await;
    info!("session {} disconnected", conn_id);
}

async fn handle_signal(
    directory: &PresenceDirectory,
    router: &DeliveryRouter,
    handle: &ConnectionHandle,
    signal: ClientSignal,
) {
    match signal {
        ClientSignal::AnnounceIdentity { identity, avatar } => {
            directory.announce(&identity, avatar, handle.clone()).await;
        }

        ClientSignal::SendMessage {
            from,
            to,
            timestamp,
            body,
        } => {
            router.route(&from, &to, timestamp, body).await;
        }

        ClientSignal::Typing { from, to, is_typing } => {
            router
                .relay(&from, &to, EphemeralSignal::Typing { is_typing })
                .await;
        }

        ClientSignal::Seen { from, to } => {
            router.relay(&from, &to, EphemeralSignal::Seen).await;
        }
    }
}
