//! Fallback path for when relay signals are lost.
//!
//! Every poll reads the durable store directly: records waiting for this
//! user's ack, this user's own records awaiting activation, overdue
//! expiry, and reconciliation of each open chat against the local cache.

use std::time::Duration;

use chatkey_shared::api::key_record::KeyStatus;
use chatkey_shared::ids::{ChatId, KeyRecordId, UserId};
use chatkey_shared::signal::Signal;
use chrono::Utc;

use crate::error::ExchangeError;
use crate::events::ExchangeEvent;
use crate::service::KeyExchangeService;

/// Exponential backoff between polls, doubling up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn delay(&self) -> Duration {
        self.current
    }

    pub fn increase(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// What a single poll changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub acknowledged: usize,
    pub completed: usize,
    pub expired: usize,
    /// Stashed keys dropped because their record expired.
    pub pruned: usize,
}

impl PollReport {
    pub fn progressed(&self) -> bool {
        self.acknowledged + self.completed + self.expired > 0
    }
}

impl KeyExchangeService {
    /// Run one fallback poll against the durable store.
    pub async fn poll_once(&self) -> Result<PollReport, ExchangeError> {
        let me = self.user_id();
        let inner = &self.inner;
        let mut report = PollReport::default();

        inner.deps.presence.record_seen(me).await;

        for record in inner.deps.store.pending_for(me).await? {
            match self.acknowledge(record.id).await {
                Ok(()) => report.acknowledged += 1,
                Err(e) => tracing::warn!(record_id = %record.id, error = %e, "poll ack failed"),
            }
        }

        report.pruned = self.sweep_stashed_keys().await?;

        let own: Vec<KeyRecordId> = inner.awaiting.iter().map(|entry| *entry.key()).collect();
        for record_id in own {
            match self.complete_own(record_id).await {
                Ok(true) => report.completed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(record_id = %record_id, error = %e, "poll completion failed")
                }
            }
        }

        let expired = inner
            .deps
            .store
            .expire_overdue(Utc::now(), inner.config.pending_max_age())
            .await?;
        for record in expired.iter().filter(|r| r.peer_of(me).is_some()) {
            report.expired += 1;
            self.on_record_expired(record)?;
        }

        let chats: Vec<ChatId> = inner.chats.iter().map(|entry| *entry.key()).collect();
        for chat_id in chats {
            if let Err(e) = self.sync_chat(chat_id).await {
                tracing::warn!(chat_id = %chat_id, error = %e, "chat reconciliation failed");
            }
        }

        if report.progressed() {
            tracing::debug!(?report, "poll made progress");
        }
        Ok(report)
    }

    /// Drop stashed keys of records that expired while nobody was tracking
    /// them, and resume tracking own records that are still live.
    ///
    /// A stash with no record yet is left alone: the record may be between
    /// stash and insert.
    async fn sweep_stashed_keys(&self) -> Result<usize, ExchangeError> {
        let me = self.user_id();
        let inner = &self.inner;
        let mut pruned = 0;
        for record_id in inner.cache.pending_ids()? {
            if inner.awaiting.contains_key(&record_id) {
                continue;
            }
            let Some(record) = inner.deps.store.get(record_id).await? else {
                continue;
            };
            if record.status != KeyStatus::Expired && record.responder_id == me {
                inner.awaiting.entry(record_id).or_insert(record.chat_id);
                continue;
            }
            inner.cache.take_pending(&record_id)?;
            pruned += 1;
            tracing::debug!(
                chat_id = %record.chat_id,
                record_id = %record_id,
                status = ?record.status,
                "dropped stashed key of a dead record"
            );
        }
        Ok(pruned)
    }

    /// Reconcile the local cache for one chat with its live record.
    ///
    /// Covers restarts on either side: an initiator whose cache lost an
    /// active key unwraps it again, a responder resumes tracking its own
    /// pending record, and a cached key whose record expired is retired.
    pub async fn sync_chat(&self, chat_id: ChatId) -> Result<(), ExchangeError> {
        let me = self.user_id();
        let inner = &self.inner;
        let cached = inner.cache.keys(&chat_id)?;

        match inner.deps.store.live_record(chat_id).await? {
            Some(live) if live.status == KeyStatus::Active => {
                if cached.find(&live.id).is_some() {
                    return Ok(());
                }
                if live.initiator_id == me {
                    self.acknowledge(live.id).await?;
                } else if live.responder_id == me {
                    self.complete_own(live.id).await?;
                }
            }
            Some(live) => {
                if live.initiator_id == me && !live.sender_ack {
                    self.acknowledge(live.id).await?;
                } else if live.responder_id == me {
                    inner.awaiting.entry(live.id).or_insert(chat_id);
                }
            }
            None => {
                let Some(active) = cached.active else {
                    return Ok(());
                };
                if let Some(record) = inner.deps.store.get(active.record_id).await? {
                    if record.status == KeyStatus::Expired {
                        self.on_record_expired(&record)?;
                    }
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn spawn_poller(service: &KeyExchangeService) -> tokio::task::JoinHandle<()> {
    let weak = service.downgrade();
    let nudge = service.inner.nudge.clone();
    let mut backoff = Backoff::new(
        service.inner.config.poll_initial(),
        service.inner.config.poll_max(),
    );

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(backoff.delay()) => {}
                _ = nudge.notified() => backoff.reset(),
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let service = KeyExchangeService { inner };
            match service.poll_once().await {
                Ok(report) if report.progressed() => backoff.reset(),
                Ok(_) => backoff.increase(),
                Err(e) => {
                    tracing::warn!(error = %e, "poll failed");
                    backoff.increase();
                }
            }
        }
    })
}

/// Watch one of this user's pending records after the ack timeout.
///
/// Re-sends the notify once, then polls the record with backoff until it
/// activates or expires. A record still pending after `pending_max_age`
/// raises [`ExchangeEvent::DeliveryFailed`]; the record itself is left for
/// the regular expiry sweep.
pub(crate) fn spawn_watchdog(
    service: &KeyExchangeService,
    record_id: KeyRecordId,
    chat_id: ChatId,
    peer: UserId,
) {
    let weak = service.downgrade();
    let config = &service.inner.config;
    let ack_timeout = config.ack_timeout();
    let mut backoff = Backoff::new(config.poll_initial(), config.poll_max());

    let handle = tokio::spawn(async move {
        tokio::time::sleep(ack_timeout).await;
        let mut renotified = false;
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let service = KeyExchangeService { inner };
            if !service.inner.awaiting.contains_key(&record_id) {
                break;
            }
            match service.inner.deps.store.get(record_id).await {
                Ok(Some(record)) if record.status == KeyStatus::Pending => {
                    if service.is_abandoned(&record) {
                        tracing::warn!(
                            chat_id = %chat_id,
                            record_id = %record_id,
                            "peer never acknowledged key record"
                        );
                        service.inner.delivery_failed.insert(chat_id);
                        service.emit(ExchangeEvent::DeliveryFailed { chat_id, record_id });
                        break;
                    }
                    if !renotified {
                        service
                            .notify_peer(peer, Signal::KeyNotify { chat_id, record_id })
                            .await;
                        renotified = true;
                    }
                }
                Ok(Some(_)) => {
                    if let Err(e) = service.complete_own(record_id).await {
                        tracing::warn!(record_id = %record_id, error = %e, "completion failed");
                    }
                    break;
                }
                Ok(None) => {
                    service.inner.awaiting.remove(&record_id);
                    break;
                }
                Err(e) => {
                    tracing::warn!(record_id = %record_id, error = %e, "watchdog read failed")
                }
            }
            let delay = backoff.delay();
            backoff.increase();
            drop(service);
            tokio::time::sleep(delay).await;
        }
        if let Some(inner) = weak.upgrade() {
            inner.watchdogs.remove(&record_id);
        }
    });
    service
        .inner
        .watchdogs
        .insert(record_id, handle.abort_handle());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.delay(), Duration::from_millis(100));
        backoff.increase();
        assert_eq!(backoff.delay(), Duration::from_millis(200));
        backoff.increase();
        assert_eq!(backoff.delay(), Duration::from_millis(350));
        backoff.increase();
        assert_eq!(backoff.delay(), Duration::from_millis(350));
    }

    #[test]
    fn backoff_reset_returns_to_initial() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..10 {
            backoff.increase();
        }
        assert_eq!(backoff.delay(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.delay(), Duration::from_secs(1));
    }

    #[test]
    fn empty_report_is_not_progress() {
        assert!(!PollReport::default().progressed());
        let report = PollReport {
            expired: 1,
            ..Default::default()
        };
        assert!(report.progressed());
    }
}
