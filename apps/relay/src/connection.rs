use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chatkey_shared::api::relay::{error_codes, ClientFrame, ServerFrame};
use chatkey_shared::ids::UserId;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::state::AppState;

const MAX_MISSED_PONGS: u8 = 2;

/// Handle a single WebSocket connection after upgrade.
pub async fn handle_connection(socket: WebSocket, state: AppState, user_id: UserId) {
    let (ws_sender, ws_receiver) = socket.split();

    let (connection_id, rx) = state.relay.register(user_id);
    if let Err(e) = state.relay.send_to(user_id, ServerFrame::Ready { user_id }) {
        tracing::warn!(user_id = %user_id, error = %e, "failed to enqueue Ready frame");
    }
    tracing::info!(user_id = %user_id, "relay connection opened");

    let pong_received = Arc::new(AtomicBool::new(true));
    let ping_interval = Duration::from_secs(state.config.ping_interval_secs.max(1));

    let mut send_handle = tokio::spawn(send_loop(
        ws_sender,
        rx,
        pong_received.clone(),
        ping_interval,
    ));
    let mut recv_handle = tokio::spawn(recv_loop(
        ws_receiver,
        state.clone(),
        user_id,
        pong_received,
    ));

    tokio::select! {
        _ = &mut send_handle => {
            recv_handle.abort();
            tracing::debug!(user_id = %user_id, "send loop exited, aborting recv loop");
        }
        _ = &mut recv_handle => {
            send_handle.abort();
            tracing::debug!(user_id = %user_id, "recv loop exited, aborting send loop");
        }
    }

    if state.relay.disconnect(user_id, connection_id) {
        tracing::info!(user_id = %user_id, "relay connection cleaned up");
    }
}

async fn send_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerFrame>,
    pong_received: Arc<AtomicBool>,
    ping_interval: Duration,
) {
    let mut ping_interval = tokio::time::interval(ping_interval);
    ping_interval.tick().await; // skip immediate first tick
    let mut missed_pongs: u8 = 0;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(frame) => match serde_json::to_string(&frame) {
                        Ok(json) => {
                            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "failed to serialize ServerFrame"),
                    },
                    None => {
                        // Replaced by a newer connection, or shutdown.
                        let _ = ws_sender.send(Message::Close(Some(CloseFrame {
                            code: 1001,
                            reason: "going away".into(),
                        }))).await;
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if !pong_received.swap(false, Ordering::SeqCst) {
                    missed_pongs += 1;
                    if missed_pongs >= MAX_MISSED_PONGS {
                        tracing::info!("connection timed out: no pong received");
                        let _ = ws_sender.send(Message::Close(Some(CloseFrame {
                            code: 1001,
                            reason: "ping timeout".into(),
                        }))).await;
                        break;
                    }
                } else {
                    missed_pongs = 0;
                }
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn recv_loop(
    mut ws_receiver: SplitStream<WebSocket>,
    state: AppState,
    user_id: UserId,
    pong_received: Arc<AtomicBool>,
) {
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                state.relay.touch(user_id);
                if text.len() > state.config.max_frame_bytes {
                    send_error(&state, user_id, error_codes::FRAME_TOO_LARGE, "frame too large");
                    continue;
                }
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => handle_client_frame(&state, user_id, frame),
                    Err(_) => send_error(
                        &state,
                        user_id,
                        error_codes::INVALID_FRAME,
                        "invalid frame format",
                    ),
                }
            }
            Ok(Message::Pong(_)) => {
                pong_received.store(true, Ordering::SeqCst);
                state.relay.touch(user_id);
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                send_error(
                    &state,
                    user_id,
                    error_codes::INVALID_FRAME,
                    "binary frames not supported",
                );
            }
            Ok(Message::Ping(_)) => {
                // Axum auto-responds with Pong
            }
            Err(e) => {
                tracing::debug!(error = %e, "websocket receive error");
                break;
            }
        }
    }
}

pub(crate) fn handle_client_frame(state: &AppState, user_id: UserId, frame: ClientFrame) {
    match frame {
        ClientFrame::Ping { ts } => {
            if let Err(e) = state.relay.send_to(user_id, ServerFrame::Pong { ts }) {
                tracing::debug!(user_id = %user_id, error = %e, "failed to enqueue Pong");
            }
        }
        ClientFrame::Send { to, signal } => {
            if let Err(e) = state.relay.deliver(user_id, to, signal) {
                tracing::debug!(
                    from = %user_id,
                    to = %to,
                    kind = signal.kind(),
                    error = %e,
                    "signal undeliverable"
                );
                if let Err(e) = state
                    .relay
                    .send_to(user_id, ServerFrame::Undeliverable { to, signal })
                {
                    tracing::debug!(
                        user_id = %user_id,
                        error = %e,
                        "failed to report undeliverable signal"
                    );
                }
            }
        }
    }
}

fn send_error(state: &AppState, user_id: UserId, code: u32, message: &str) {
    let frame = ServerFrame::Error {
        code,
        message: message.to_string(),
    };
    if let Err(e) = state.relay.send_to(user_id, frame) {
        tracing::warn!(user_id = %user_id, error = %e, "failed to send error frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use chatkey_shared::ids::{ChatId, KeyRecordId};
    use chatkey_shared::signal::Signal;

    fn signal() -> Signal {
        Signal::Ack {
            chat_id: ChatId::new(),
            record_id: KeyRecordId::new(),
        }
    }

    #[test]
    fn send_frame_is_forwarded_to_recipient() {
        let state = AppState::new(RelayConfig::default());
        let (alice, bob) = (UserId::new(), UserId::new());
        let (_, _alice_rx) = state.relay.register(alice);
        let (_, mut bob_rx) = state.relay.register(bob);
        let signal = signal();

        handle_client_frame(&state, alice, ClientFrame::Send { to: bob, signal });
        match bob_rx.try_recv().unwrap() {
            ServerFrame::Deliver { from, signal: s } => {
                assert_eq!(from, alice);
                assert_eq!(s, signal);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn offline_recipient_is_reported_undeliverable() {
        let state = AppState::new(RelayConfig::default());
        let (alice, bob) = (UserId::new(), UserId::new());
        let (_, mut alice_rx) = state.relay.register(alice);
        let signal = signal();

        handle_client_frame(&state, alice, ClientFrame::Send { to: bob, signal });
        match alice_rx.try_recv().unwrap() {
            ServerFrame::Undeliverable { to, signal: s } => {
                assert_eq!(to, bob);
                assert_eq!(s, signal);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let state = AppState::new(RelayConfig::default());
        let user = UserId::new();
        let (_, mut rx) = state.relay.register(user);

        handle_client_frame(&state, user, ClientFrame::Ping { ts: 42 });
        assert!(matches!(rx.try_recv().unwrap(), ServerFrame::Pong { ts: 42 }));
    }
}
