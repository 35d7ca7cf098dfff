//! Low-latency signal transport.
//!
//! Signals carry record ids only. Delivery is best effort; anything the
//! relay drops is picked up by the fallback poller from the durable store.

use async_trait::async_trait;
use chatkey_shared::ids::UserId;
use chatkey_shared::signal::Signal;
use dashmap::{DashMap, DashSet};
use thiserror::Error;
use tokio::sync::mpsc;

const SUBSCRIBER_MPSC_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("user {0} is not reachable over the relay")]
    Unreachable(UserId),

    #[error("relay queue for user {0} is full")]
    Backpressure(UserId),

    #[error("relay connection is down")]
    Disconnected,

    #[error("cannot connect to relay: {0}")]
    Connect(String),

    #[error("relay protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait Relay: Send + Sync {
    async fn send(&self, to: UserId, signal: Signal) -> Result<(), TransportError>;

    /// Open the inbound signal stream for `user`. A newer subscription
    /// replaces an older one, whose receiver then ends.
    async fn subscribe(&self, user: UserId) -> mpsc::Receiver<Signal>;
}

/// In-process relay. `set_reachable` simulates a user whose connection is
/// down: sends to them fail as if the relay had no route.
#[derive(Default)]
pub struct InMemoryRelay {
    subscribers: DashMap<UserId, mpsc::Sender<Signal>>,
    unreachable: DashSet<UserId>,
}

impl InMemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, user: UserId, reachable: bool) {
        if reachable {
            self.unreachable.remove(&user);
        } else {
            self.unreachable.insert(user);
        }
    }

    pub fn disconnect(&self, user: UserId) {
        self.subscribers.remove(&user);
    }

    pub fn is_connected(&self, user: UserId) -> bool {
        self.subscribers
            .get(&user)
            .is_some_and(|sender| !sender.is_closed())
    }
}

#[async_trait]
impl Relay for InMemoryRelay {
    async fn send(&self, to: UserId, signal: Signal) -> Result<(), TransportError> {
        if self.unreachable.contains(&to) {
            tracing::debug!(to = %to, kind = signal.kind(), "relay route down");
            return Err(TransportError::Unreachable(to));
        }
        let sender = self
            .subscribers
            .get(&to)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::Unreachable(to))?;

        match sender.try_send(signal) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::Backpressure(to)),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.subscribers.remove_if(&to, |_, s| s.is_closed());
                Err(TransportError::Unreachable(to))
            }
        }
    }

    async fn subscribe(&self, user: UserId) -> mpsc::Receiver<Signal> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_MPSC_CAPACITY);
        self.subscribers.insert(user, tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatkey_shared::ids::{ChatId, KeyRecordId};

    fn notify() -> Signal {
        Signal::KeyNotify {
            chat_id: ChatId::new(),
            record_id: KeyRecordId::new(),
        }
    }

    #[tokio::test]
    async fn subscribed_user_receives_signal() {
        let relay = InMemoryRelay::new();
        let user = UserId::new();
        let mut rx = relay.subscribe(user).await;
        let signal = notify();

        relay.send(user, signal).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), signal);
    }

    #[tokio::test]
    async fn unsubscribed_user_is_unreachable() {
        let relay = InMemoryRelay::new();
        let user = UserId::new();
        assert_eq!(
            relay.send(user, notify()).await,
            Err(TransportError::Unreachable(user))
        );
    }

    #[tokio::test]
    async fn route_down_fails_until_restored() {
        let relay = InMemoryRelay::new();
        let user = UserId::new();
        let mut rx = relay.subscribe(user).await;

        relay.set_reachable(user, false);
        assert!(relay.send(user, notify()).await.is_err());
        assert!(rx.try_recv().is_err());

        relay.set_reachable(user, true);
        relay.send(user, notify()).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn dropped_receiver_is_unreachable() {
        let relay = InMemoryRelay::new();
        let user = UserId::new();
        drop(relay.subscribe(user).await);
        assert!(!relay.is_connected(user));
        assert_eq!(
            relay.send(user, notify()).await,
            Err(TransportError::Unreachable(user))
        );
    }

    #[tokio::test]
    async fn resubscribe_replaces_old_stream() {
        let relay = InMemoryRelay::new();
        let user = UserId::new();
        let mut old = relay.subscribe(user).await;
        let mut new = relay.subscribe(user).await;

        relay.send(user, notify()).await.unwrap();
        assert!(new.try_recv().is_ok());
        // Old sender was dropped on replace.
        assert!(old.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_queue_reports_backpressure() {
        let relay = InMemoryRelay::new();
        let user = UserId::new();
        let _rx = relay.subscribe(user).await;
        for _ in 0..SUBSCRIBER_MPSC_CAPACITY {
            relay.send(user, notify()).await.unwrap();
        }
        assert_eq!(
            relay.send(user, notify()).await,
            Err(TransportError::Backpressure(user))
        );
    }
}
