use std::sync::Arc;

use chatkey_shared::api::relay::{PresenceResponse, ServerFrame};
use chatkey_shared::error::ChatKeyError;
use chatkey_shared::ids::UserId;
use chatkey_shared::signal::Signal;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::config::RelayConfig;

const CONNECTION_MPSC_CAPACITY: usize = 256;

/// Shared application state passed to all handlers via Axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub relay: Arc<RelayState>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config: Arc::new(config),
            relay: Arc::new(RelayState::new()),
        }
    }
}

/// Live connections, one per user. A newer connection replaces the older.
pub struct RelayState {
    pub connections: DashMap<UserId, ConnectionState>,
    last_seen: DashMap<UserId, DateTime<Utc>>,
}

pub struct ConnectionState {
    /// Distinguishes a replaced connection from its successor on cleanup.
    pub connection_id: uuid::Uuid,
    pub sender: mpsc::Sender<ServerFrame>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            last_seen: DashMap::new(),
        }
    }

    /// Register `user`'s connection, dropping any previous one.
    pub fn register(&self, user_id: UserId) -> (uuid::Uuid, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(CONNECTION_MPSC_CAPACITY);
        let connection_id = uuid::Uuid::new_v4();
        self.connections.insert(
            user_id,
            ConnectionState {
                connection_id,
                sender: tx,
            },
        );
        self.touch(user_id);
        (connection_id, rx)
    }

    /// Remove the connection if it is still the registered one.
    pub fn disconnect(&self, user_id: UserId, connection_id: uuid::Uuid) -> bool {
        let removed = self
            .connections
            .remove_if(&user_id, |_, conn| conn.connection_id == connection_id)
            .is_some();
        if removed {
            self.touch(user_id);
        }
        removed
    }

    pub fn touch(&self, user_id: UserId) {
        self.last_seen.insert(user_id, Utc::now());
    }

    pub fn send_to(&self, user_id: UserId, frame: ServerFrame) -> Result<(), ChatKeyError> {
        let sender = self
            .connections
            .get(&user_id)
            .map(|conn| conn.sender.clone())
            .ok_or(ChatKeyError::Unreachable)?;
        sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ChatKeyError::ServiceUnavailable(format!("queue for {user_id} is full"))
            }
            mpsc::error::TrySendError::Closed(_) => ChatKeyError::Unreachable,
        })
    }

    /// Forward `signal` from `from` to `to`'s live connection.
    pub fn deliver(&self, from: UserId, to: UserId, signal: Signal) -> Result<(), ChatKeyError> {
        self.send_to(to, ServerFrame::Deliver { from, signal })
    }

    pub fn presence(&self, user_id: UserId) -> PresenceResponse {
        PresenceResponse {
            user_id,
            online: self
                .connections
                .get(&user_id)
                .is_some_and(|conn| !conn.sender.is_closed()),
            last_seen: self.last_seen.get(&user_id).map(|seen| *seen.value()),
        }
    }

    /// Drop every connection; send loops see their channel close.
    pub fn shutdown_all(&self) {
        self.connections.clear();
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}
