//! Periodic key rotation.

use std::sync::Weak;
use std::time::Duration;

use chatkey_shared::api::key_record::{KeyRecord, KeyStatus};
use chatkey_shared::ids::{ChatId, KeyRecordId, UserId};
use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;

use crate::error::ExchangeError;
use crate::service::{Created, Inner, KeyExchangeService, SetGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// A new pending record was created.
    Started(KeyRecordId),
    /// A pending record already holds the chat's live slot.
    InFlight(KeyRecordId),
    NotDue,
    /// The peer has not been seen within the liveness window.
    StalePeer { peer: UserId },
}

impl RotationOutcome {
    pub fn record_id(&self) -> Option<KeyRecordId> {
        match self {
            RotationOutcome::Started(id) | RotationOutcome::InFlight(id) => Some(*id),
            RotationOutcome::NotDue | RotationOutcome::StalePeer { .. } => None,
        }
    }
}

fn elapsed_at_least(since: DateTime<Utc>, now: DateTime<Utc>, period: Duration) -> bool {
    match chrono::Duration::from_std(period) {
        Ok(period) => now - since >= period,
        Err(_) => false,
    }
}

impl KeyExchangeService {
    /// Rotate if the active key is older than the rotation interval.
    pub async fn maybe_rotate(&self, chat_id: ChatId) -> Result<RotationOutcome, ExchangeError> {
        self.rotate(chat_id, false).await
    }

    /// Rotate regardless of the key's age. The liveness gate still applies.
    pub async fn force_rotate(&self, chat_id: ChatId) -> Result<RotationOutcome, ExchangeError> {
        self.rotate(chat_id, true).await
    }

    /// Answer a peer that could not open this user's record for the chat.
    ///
    /// A pending record this user created is replaced in the same
    /// transaction; anything else is a forced rotation.
    pub(crate) async fn rotate_on_request(
        &self,
        chat_id: ChatId,
    ) -> Result<RotationOutcome, ExchangeError> {
        let peer = self.peer_of(chat_id)?;
        let store = &self.inner.deps.store;

        let Some(guard) = SetGuard::acquire(&self.inner.rotating, chat_id) else {
            return Ok(in_flight_or_not_due(store.live_record(chat_id).await?));
        };
        let rejected = match store.live_record(chat_id).await? {
            Some(live)
                if live.status == KeyStatus::Pending && live.responder_id == self.user_id() =>
            {
                live
            }
            _ => {
                drop(guard);
                return self.force_rotate(chat_id).await;
            }
        };

        match self.create_record(chat_id, peer, Some(rejected.id)).await? {
            Created::New(id) => {
                if let Some(old) = store.get(rejected.id).await? {
                    self.on_record_expired(&old)?;
                }
                tracing::info!(
                    chat_id = %chat_id,
                    rejected = %rejected.id,
                    record_id = %id,
                    "replaced key record the peer could not open"
                );
                Ok(RotationOutcome::Started(id))
            }
            Created::Existing(id) => Ok(RotationOutcome::InFlight(id)),
        }
    }

    async fn rotate(&self, chat_id: ChatId, force: bool) -> Result<RotationOutcome, ExchangeError> {
        let peer = self.peer_of(chat_id)?;
        let store = &self.inner.deps.store;

        let Some(_guard) = SetGuard::acquire(&self.inner.rotating, chat_id) else {
            return Ok(in_flight_or_not_due(store.live_record(chat_id).await?));
        };

        let now = Utc::now();
        let supersede = match store.live_record(chat_id).await? {
            Some(live) if live.status == KeyStatus::Pending => {
                if !self.is_abandoned(&live) {
                    return Ok(RotationOutcome::InFlight(live.id));
                }
                None
            }
            Some(live) => {
                let since = live.activated_at.unwrap_or(live.created_at);
                let due = force
                    || live.expires_at <= now
                    || elapsed_at_least(since, now, self.inner.config.rotation_interval());
                if !due {
                    return Ok(RotationOutcome::NotDue);
                }
                Some(live.id)
            }
            None if force => None,
            None => return Ok(RotationOutcome::NotDue),
        };

        let live_peer = self
            .inner
            .deps
            .presence
            .is_recently_online(peer, self.inner.config.liveness_window())
            .await;
        if !live_peer {
            tracing::info!(
                chat_id = %chat_id,
                peer = %peer,
                "peer not seen recently, rotation deferred"
            );
            return Ok(RotationOutcome::StalePeer { peer });
        }

        match self.create_record(chat_id, peer, supersede).await? {
            Created::New(id) => {
                tracing::info!(
                    chat_id = %chat_id,
                    record_id = %id,
                    forced = force,
                    "key rotation started"
                );
                Ok(RotationOutcome::Started(id))
            }
            Created::Existing(id) => Ok(RotationOutcome::InFlight(id)),
        }
    }
}

fn in_flight_or_not_due(live: Option<KeyRecord>) -> RotationOutcome {
    match live {
        Some(record) if record.status == KeyStatus::Pending => RotationOutcome::InFlight(record.id),
        _ => RotationOutcome::NotDue,
    }
}

/// Check the chat every `period` until it is closed or the service dropped.
pub(crate) fn spawn_rotation_task(
    weak: Weak<Inner>,
    chat_id: ChatId,
    period: Duration,
) -> tokio::task::AbortHandle {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let service = KeyExchangeService { inner };
            match service.maybe_rotate(chat_id).await {
                Ok(RotationOutcome::NotDue) => {}
                Ok(outcome) => tracing::debug!(chat_id = %chat_id, ?outcome, "rotation check"),
                Err(ExchangeError::ChatNotOpen(_)) => break,
                Err(e) => tracing::warn!(chat_id = %chat_id, error = %e, "rotation check failed"),
            }
        }
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_record_id() {
        let id = KeyRecordId::new();
        assert_eq!(RotationOutcome::Started(id).record_id(), Some(id));
        assert_eq!(RotationOutcome::InFlight(id).record_id(), Some(id));
        assert_eq!(RotationOutcome::NotDue.record_id(), None);
        assert_eq!(
            RotationOutcome::StalePeer { peer: UserId::new() }.record_id(),
            None
        );
    }

    #[test]
    fn elapsed_is_inclusive() {
        let now = Utc::now();
        let since = now - chrono::Duration::seconds(60);
        assert!(elapsed_at_least(since, now, Duration::from_secs(60)));
        assert!(!elapsed_at_least(since, now, Duration::from_secs(61)));
        assert!(elapsed_at_least(now, now, Duration::ZERO));
    }
}
