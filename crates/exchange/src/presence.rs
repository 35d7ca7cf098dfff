//! Liveness collaborator used to gate rotation.

use std::time::Duration;

use async_trait::async_trait;
use chatkey_shared::ids::UserId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[async_trait]
pub trait Presence: Send + Sync {
    /// Whether `user` was seen within `window`.
    async fn is_recently_online(&self, user: UserId, window: Duration) -> bool;

    /// Heartbeat from `user`'s own client; the service calls it on every poll.
    async fn record_seen(&self, user: UserId);
}

/// Last-seen timestamps held in memory.
#[derive(Default)]
pub struct InMemoryPresence {
    last_seen: DashMap<UserId, DateTime<Utc>>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_seen_at(&self, user: UserId, at: DateTime<Utc>) {
        self.last_seen.insert(user, at);
    }

    pub fn forget(&self, user: UserId) {
        self.last_seen.remove(&user);
    }

    pub fn last_seen(&self, user: UserId) -> Option<DateTime<Utc>> {
        self.last_seen.get(&user).map(|entry| *entry.value())
    }
}

#[async_trait]
impl Presence for InMemoryPresence {
    async fn is_recently_online(&self, user: UserId, window: Duration) -> bool {
        let Some(seen) = self.last_seen(user) else {
            return false;
        };
        let Ok(window) = chrono::Duration::from_std(window) else {
            return true;
        };
        Utc::now() - seen <= window
    }

    async fn record_seen(&self, user: UserId) {
        self.mark_seen_at(user, Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn unseen_user_is_offline() {
        let presence = InMemoryPresence::new();
        assert!(!presence.is_recently_online(UserId::new(), WINDOW).await);
    }

    #[tokio::test]
    async fn recent_heartbeat_is_online() {
        let presence = InMemoryPresence::new();
        let user = UserId::new();
        presence.record_seen(user).await;
        assert!(presence.is_recently_online(user, WINDOW).await);
    }

    #[tokio::test]
    async fn heartbeat_outside_window_is_offline() {
        let presence = InMemoryPresence::new();
        let user = UserId::new();
        presence.mark_seen_at(user, Utc::now() - chrono::Duration::minutes(10));
        assert!(!presence.is_recently_online(user, WINDOW).await);
    }

    #[tokio::test]
    async fn forget_clears_last_seen() {
        let presence = InMemoryPresence::new();
        let user = UserId::new();
        presence.record_seen(user).await;
        presence.forget(user);
        assert!(presence.last_seen(user).is_none());
    }
}
