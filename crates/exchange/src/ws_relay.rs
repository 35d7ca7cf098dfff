//! WebSocket client for the relay server (`apps/relay`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatkey_shared::api::relay::{ClientFrame, ServerFrame};
use chatkey_shared::ids::UserId;
use chatkey_shared::signal::Signal;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::poller::Backoff;
use crate::relay::{Relay, TransportError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_MPSC_CAPACITY: usize = 256;
const INBOUND_MPSC_CAPACITY: usize = 256;
const READY_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_INITIAL: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Shared {
    outbound: Mutex<Option<mpsc::Sender<ClientFrame>>>,
    inbound: Mutex<Option<mpsc::Sender<Signal>>>,
    undelivered: AtomicU64,
}

/// One user's connection to the relay server.
///
/// The socket is reconnected with backoff when it drops. Each drop and
/// each reconnect ends the current subscriber stream, so the service's
/// listener resubscribes and polls the store for anything it missed.
pub struct WsRelay {
    user: UserId,
    shared: Arc<Shared>,
    task: AbortHandle,
}

impl WsRelay {
    /// Connect as `user` to the relay at `base_url` (`ws://host:port`) and
    /// wait until the relay has registered the connection.
    pub async fn connect(base_url: &str, user: UserId) -> Result<Self, TransportError> {
        let url = format!("{}/ws?user_id={user}", base_url.trim_end_matches('/'));
        let socket = open_socket(&url, user).await?;

        let shared = Arc::new(Shared::default());
        let (tx, rx) = mpsc::channel(OUTBOUND_MPSC_CAPACITY);
        shared.set_outbound(Some(tx));
        let task = tokio::spawn(run(shared.clone(), url, user, socket, rx)).abort_handle();
        tracing::info!(user_id = %user, "connected to relay");

        Ok(Self { user, shared, task })
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .outbound
            .lock()
            .is_ok_and(|slot| slot.as_ref().is_some_and(|tx| !tx.is_closed()))
    }

    /// Whether a subscriber is currently receiving delivered signals.
    pub fn is_subscribed(&self) -> bool {
        self.shared
            .inbound
            .lock()
            .is_ok_and(|slot| slot.as_ref().is_some_and(|tx| !tx.is_closed()))
    }

    /// Signals the relay reported as undeliverable because the recipient
    /// had no live connection.
    pub fn undelivered(&self) -> u64 {
        self.shared.undelivered.load(Ordering::Relaxed)
    }
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl Relay for WsRelay {
    async fn send(&self, to: UserId, signal: Signal) -> Result<(), TransportError> {
        let outbound = self
            .shared
            .outbound
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().cloned())
            .ok_or(TransportError::Disconnected)?;

        match outbound.try_send(ClientFrame::Send { to, signal }) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::Backpressure(to)),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Disconnected),
        }
    }

    async fn subscribe(&self, user: UserId) -> mpsc::Receiver<Signal> {
        let (tx, rx) = mpsc::channel(INBOUND_MPSC_CAPACITY);
        if user == self.user {
            self.shared.set_inbound(Some(tx));
        } else {
            tracing::warn!(
                user_id = %user,
                connected_as = %self.user,
                "subscription for a user this connection does not carry"
            );
        }
        rx
    }
}

impl Shared {
    fn set_outbound(&self, tx: Option<mpsc::Sender<ClientFrame>>) {
        if let Ok(mut slot) = self.outbound.lock() {
            *slot = tx;
        }
    }

    fn set_inbound(&self, tx: Option<mpsc::Sender<Signal>>) {
        if let Ok(mut slot) = self.inbound.lock() {
            *slot = tx;
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "unparsable frame from relay");
                return;
            }
        };
        match frame {
            ServerFrame::Deliver { from, signal } => {
                let inbound = self
                    .inbound
                    .lock()
                    .ok()
                    .and_then(|slot| slot.as_ref().cloned());
                match inbound {
                    Some(tx) => {
                        if tx.try_send(signal).is_err() {
                            tracing::warn!(
                                from = %from,
                                kind = signal.kind(),
                                "inbound signal dropped"
                            );
                        }
                    }
                    None => tracing::debug!(from = %from, kind = signal.kind(), "no subscriber"),
                }
            }
            ServerFrame::Undeliverable { to, signal } => {
                self.undelivered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    to = %to,
                    kind = signal.kind(),
                    "peer not connected, the record waits in the store"
                );
            }
            ServerFrame::Error { code, message } => {
                tracing::warn!(code, message = %message, "relay reported an error");
            }
            ServerFrame::Ready { .. } | ServerFrame::Pong { .. } => {}
        }
    }
}

/// Open the socket and read up to the relay's Ready frame.
async fn open_socket(url: &str, user: UserId) -> Result<Socket, TransportError> {
    let (mut socket, _) = connect_async(url)
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;

    let ready = tokio::time::timeout(READY_TIMEOUT, async {
        while let Some(message) = socket.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Ready { user_id }) if user_id == user => return Ok(()),
                    Ok(other) => tracing::debug!(?other, "frame before Ready ignored"),
                    Err(e) => return Err(TransportError::Protocol(e.to_string())),
                },
                Ok(_) => {}
                Err(e) => return Err(TransportError::Connect(e.to_string())),
            }
        }
        Err(TransportError::Disconnected)
    })
    .await;

    match ready {
        Ok(Ok(())) => Ok(socket),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TransportError::Connect("no Ready frame from relay".into())),
    }
}

async fn run(
    shared: Arc<Shared>,
    url: String,
    user: UserId,
    mut socket: Socket,
    mut outbound: mpsc::Receiver<ClientFrame>,
) {
    let mut backoff = Backoff::new(RECONNECT_INITIAL, RECONNECT_MAX);
    loop {
        session(&shared, socket, outbound).await;
        shared.set_outbound(None);
        shared.set_inbound(None);
        tracing::warn!(user_id = %user, "relay connection lost");

        socket = loop {
            tokio::time::sleep(backoff.delay()).await;
            backoff.increase();
            match open_socket(&url, user).await {
                Ok(socket) => break socket,
                Err(e) => tracing::debug!(user_id = %user, error = %e, "relay reconnect failed"),
            }
        };
        backoff.reset();

        let (tx, rx) = mpsc::channel(OUTBOUND_MPSC_CAPACITY);
        shared.set_outbound(Some(tx));
        // Signals sent while we were away are only in the store now.
        shared.set_inbound(None);
        outbound = rx;
        tracing::info!(user_id = %user, "reconnected to relay");
    }
}

async fn session(shared: &Shared, socket: Socket, mut outbound: mpsc::Receiver<ClientFrame>) {
    let (mut write, mut read) = socket.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize ClientFrame");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    tracing::debug!(error = %e, "relay write failed");
                    break;
                }
            }
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => shared.handle_frame(&text),
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "relay read failed");
                        break;
                    }
                }
            }
        }
    }
}
