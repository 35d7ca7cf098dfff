//! The key exchange service: one instance per signed-in user.
//!
//! Roles follow the record: the party that creates a record generates the
//! key (responder) and wraps it for the other party (initiator), who
//! acknowledges it. The store activates the record once both acks are set.

use std::sync::{Arc, Mutex, Weak};

use chatkey_crypto::cipher::EncryptedMessage;
use chatkey_crypto::error::DecryptError;
use chatkey_crypto::identity::UserIdentity;
use chatkey_crypto::key::MessageKey;
use chatkey_crypto::keystore::{CachedKey, KeyStore};
use chatkey_crypto::signature::RecordFields;
use chatkey_crypto::wrap::wrap_context;
use chatkey_shared::api::key_record::{KeyRecord, KeyStatus, KeyStatusView};
use chatkey_shared::display::MessageDisplay;
use chatkey_shared::ids::{ChatId, KeyRecordId, UserId};
use chatkey_shared::signal::Signal;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::{broadcast, Notify};
use tokio::task::AbortHandle;

use crate::cache::{Installed, KeyCache};
use crate::config::ExchangeConfig;
use crate::directory::Directory;
use crate::error::ExchangeError;
use crate::events::ExchangeEvent;
use crate::presence::Presence;
use crate::relay::Relay;
use crate::store::{KeyRecordStore, NewKeyRecord, StoreError};

const EVENT_BROADCAST_CAPACITY: usize = 64;

/// External collaborators the service is built on.
#[derive(Clone)]
pub struct ServiceDeps {
    pub store: Arc<dyn KeyRecordStore>,
    pub directory: Arc<dyn Directory>,
    pub presence: Arc<dyn Presence>,
    pub relay: Arc<dyn Relay>,
}

#[derive(Clone)]
pub struct KeyExchangeService {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) identity: UserIdentity,
    pub(crate) deps: ServiceDeps,
    pub(crate) cache: KeyCache,
    pub(crate) config: ExchangeConfig,
    pub(crate) chats: DashMap<ChatId, OpenChat>,
    /// Chats with a local rotation attempt under way.
    pub(crate) rotating: DashSet<ChatId>,
    /// Records this user created that have not activated yet.
    pub(crate) awaiting: DashMap<KeyRecordId, ChatId>,
    pub(crate) completing: DashSet<KeyRecordId>,
    pub(crate) watchdogs: DashMap<KeyRecordId, AbortHandle>,
    pub(crate) delivery_failed: DashSet<ChatId>,
    pub(crate) events: broadcast::Sender<ExchangeEvent>,
    pub(crate) nudge: Arc<Notify>,
    pub(crate) background: Mutex<Vec<AbortHandle>>,
}

pub(crate) struct OpenChat {
    pub(crate) peer: UserId,
    rotation: AbortHandle,
}

/// Outcome of creating a record: ours, or the one that beat us to the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Created {
    New(KeyRecordId),
    Existing(KeyRecordId),
}

/// Holds a key in a `DashSet` for the guard's lifetime.
pub(crate) struct SetGuard<'a, K: Eq + std::hash::Hash + Copy> {
    set: &'a DashSet<K>,
    key: K,
}

impl<'a, K: Eq + std::hash::Hash + Copy> SetGuard<'a, K> {
    pub(crate) fn acquire(set: &'a DashSet<K>, key: K) -> Option<Self> {
        set.insert(key).then(|| Self { set, key })
    }
}

impl<K: Eq + std::hash::Hash + Copy> Drop for SetGuard<'_, K> {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}

impl KeyExchangeService {
    pub fn new(
        identity: UserIdentity,
        deps: ServiceDeps,
        cache: Arc<dyn KeyStore>,
        config: ExchangeConfig,
    ) -> Result<Self, ExchangeError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                cache: KeyCache::new(cache, config.history_cap),
                identity,
                deps,
                config,
                chats: DashMap::new(),
                rotating: DashSet::new(),
                awaiting: DashMap::new(),
                completing: DashSet::new(),
                watchdogs: DashMap::new(),
                delivery_failed: DashSet::new(),
                events,
                nudge: Arc::new(Notify::new()),
                background: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.inner.identity.user_id
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn peer_of(&self, chat_id: ChatId) -> Result<UserId, ExchangeError> {
        self.inner
            .chats
            .get(&chat_id)
            .map(|chat| chat.peer)
            .ok_or(ExchangeError::ChatNotOpen(chat_id))
    }

    pub(crate) fn emit(&self, event: ExchangeEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.inner.events.subscribe()
    }

    /// Wake the fallback poller now and reset its backoff.
    pub fn nudge(&self) {
        self.inner.nudge.notify_one();
    }

    /// Start tracking a one-to-one chat with `peer` and its rotation task.
    pub async fn open_chat(&self, chat_id: ChatId, peer: UserId) -> Result<(), ExchangeError> {
        if peer == self.user_id() {
            return Err(ExchangeError::InvalidPeer(peer));
        }
        let rotation = crate::scheduler::spawn_rotation_task(
            self.downgrade(),
            chat_id,
            self.inner.config.rotation_check(),
        );
        if let Some(previous) = self.inner.chats.insert(chat_id, OpenChat { peer, rotation }) {
            previous.rotation.abort();
        }
        tracing::debug!(chat_id = %chat_id, peer = %peer, "chat opened");
        Ok(())
    }

    /// Stop the chat's rotation task. Records in the store are left as they are.
    pub fn close_chat(&self, chat_id: ChatId) {
        if let Some((_, chat)) = self.inner.chats.remove(&chat_id) {
            chat.rotation.abort();
            tracing::debug!(chat_id = %chat_id, "chat closed");
        }
    }

    /// Close the chat and drop its cached keys from the local key store.
    ///
    /// Keys of superseded and expired records are gone for good on this
    /// device. Records in the store are untouched, so the key of a live
    /// record comes back at the next reconciliation.
    pub fn forget_chat(&self, chat_id: ChatId) -> Result<(), ExchangeError> {
        self.close_chat(chat_id);
        self.inner.delivery_failed.remove(&chat_id);
        self.inner.cache.forget(&chat_id)?;
        tracing::info!(chat_id = %chat_id, "cached keys forgotten");
        Ok(())
    }

    /// Spawn the relay listener and the fallback poller. Calling it again
    /// while running does nothing.
    pub fn start(&self) -> Result<(), ExchangeError> {
        let mut background = self
            .inner
            .background
            .lock()
            .map_err(|_| ExchangeError::Task("background task list poisoned".into()))?;
        if !background.is_empty() {
            return Ok(());
        }
        background.push(spawn_listener(self).abort_handle());
        background.push(crate::poller::spawn_poller(self).abort_handle());
        tracing::info!(user_id = %self.user_id(), "key exchange service started");
        Ok(())
    }

    /// Abort every background task. Durable records are untouched.
    pub fn shutdown(&self) {
        if let Ok(mut background) = self.inner.background.lock() {
            for handle in background.drain(..) {
                handle.abort();
            }
        }
        let chats: Vec<ChatId> = self.inner.chats.iter().map(|c| *c.key()).collect();
        for chat_id in chats {
            self.close_chat(chat_id);
        }
        for watchdog in self.inner.watchdogs.iter() {
            watchdog.value().abort();
        }
        self.inner.watchdogs.clear();
        tracing::info!(user_id = %self.user_id(), "key exchange service stopped");
    }

    /// Return the chat's live record id, creating a pending record first if
    /// the chat has none. Concurrent callers converge on one record.
    pub async fn initiate_exchange(&self, chat_id: ChatId) -> Result<KeyRecordId, ExchangeError> {
        let peer = self.peer_of(chat_id)?;
        let now = Utc::now();
        let supersede = match self.inner.deps.store.live_record(chat_id).await? {
            Some(live) if live.status == KeyStatus::Active && live.expires_at <= now => {
                Some(live.id)
            }
            Some(live) if live.status == KeyStatus::Pending && self.is_abandoned(&live) => None,
            Some(live) => return Ok(live.id),
            None => None,
        };
        Ok(self.create_record(chat_id, peer, supersede).await?.id())
    }

    pub(crate) fn is_abandoned(&self, record: &KeyRecord) -> bool {
        chrono::Duration::from_std(self.inner.config.pending_max_age())
            .map(|max_age| Utc::now() - record.created_at > max_age)
            .unwrap_or(false)
    }

    /// Generate, wrap, sign and insert a pending record for `peer`.
    pub(crate) async fn create_record(
        &self,
        chat_id: ChatId,
        peer: UserId,
        supersede: Option<KeyRecordId>,
    ) -> Result<Created, ExchangeError> {
        let me = self.user_id();
        let inner = &self.inner;
        let peer_public = inner.deps.directory.get_public_key(peer).await?;

        let record_id = KeyRecordId::new();
        let key = MessageKey::generate();
        let wrapped_key = peer_public.wrap_key(&key, &wrap_context(&chat_id, &record_id))?;
        let signature = inner.identity.private_key_handle.sign_record(RecordFields {
            record_id: &record_id,
            chat_id: &chat_id,
            initiator_id: &peer,
            responder_id: &me,
            wrapped_key: &wrapped_key,
        });

        // Stash before insert: the record can activate as soon as it exists.
        inner.cache.stash_pending(&record_id, &key)?;
        let new = NewKeyRecord {
            id: record_id,
            chat_id,
            wrapped_key,
            initiator_id: peer,
            responder_id: me,
            signature,
            created_at: Utc::now(),
            lifetime: inner.config.key_lifetime(),
        };

        match inner
            .deps
            .store
            .insert_pending(new, supersede, inner.config.pending_max_age())
            .await
        {
            Ok(record) => {
                inner.awaiting.insert(record.id, chat_id);
                tracing::info!(
                    chat_id = %chat_id,
                    record_id = %record.id,
                    "created pending key record"
                );
                self.notify_peer(peer, Signal::KeyNotify { chat_id, record_id }).await;
                crate::poller::spawn_watchdog(self, record.id, chat_id, peer);
                Ok(Created::New(record.id))
            }
            Err(StoreError::Conflict(reason)) => {
                inner.cache.take_pending(&record_id)?;
                tracing::debug!(
                    chat_id = %chat_id,
                    reason = %reason,
                    "lost race for live slot, converging"
                );
                match inner.deps.store.live_record(chat_id).await? {
                    Some(winner) => Ok(Created::Existing(winner.id)),
                    None => Err(ExchangeError::StateConflict(reason)),
                }
            }
            Err(e) => {
                if let Err(stash_err) = inner.cache.take_pending(&record_id) {
                    tracing::warn!(error = %stash_err, "failed to drop stashed key");
                }
                Err(e.into())
            }
        }
    }

    pub(crate) async fn notify_peer(&self, peer: UserId, signal: Signal) {
        if let Err(e) = self.inner.deps.relay.send(peer, signal).await {
            tracing::debug!(
                peer = %peer,
                kind = signal.kind(),
                error = %e,
                "relay send failed, peer will find the record by polling"
            );
        }
    }

    /// Verify the responder's signature and unwrap the record's key.
    async fn open_record(&self, record: &KeyRecord) -> Result<MessageKey, ExchangeError> {
        let responder = self
            .inner
            .deps
            .directory
            .get_public_key(record.responder_id)
            .await?;
        let opened = responder
            .verify_record(RecordFields::from(record), &record.signature)
            .and_then(|()| {
                self.inner
                    .identity
                    .private_key_handle
                    .unwrap_key(&record.wrapped_key, &wrap_context(&record.chat_id, &record.id))
            });
        match opened {
            Ok(key) => Ok(key),
            Err(e) => {
                tracing::warn!(
                    chat_id = %record.chat_id,
                    record_id = %record.id,
                    error = %e,
                    "cannot open key record, asking responder to rotate"
                );
                self.notify_peer(
                    record.responder_id,
                    Signal::RotateRequest {
                        chat_id: record.chat_id,
                    },
                )
                .await;
                Err(e.into())
            }
        }
    }

    /// Acknowledge a record addressed to this user. Activation happens in
    /// the store as part of the ack write.
    pub async fn acknowledge(&self, record_id: KeyRecordId) -> Result<(), ExchangeError> {
        let me = self.user_id();
        let store = &self.inner.deps.store;
        let record = store
            .get(record_id)
            .await?
            .ok_or(StoreError::NotFound(record_id))?;
        if record.initiator_id != me {
            return Err(ExchangeError::NotParticipant {
                user: me,
                record: record_id,
            });
        }
        match record.status {
            KeyStatus::Expired => return Err(ExchangeError::RecordExpired(record_id)),
            KeyStatus::Active => {
                if self.inner.cache.keys(&record.chat_id)?.find(&record_id).is_some() {
                    return Ok(());
                }
            }
            KeyStatus::Pending => {}
        }

        let key = self.open_record(&record).await?;
        let current = match record.status {
            KeyStatus::Pending => store.acknowledge(record_id, me).await?,
            _ => record,
        };
        if current.status == KeyStatus::Active {
            self.install_record_key(&current, key)?;
            self.notify_peer(
                current.responder_id,
                Signal::Ack {
                    chat_id: current.chat_id,
                    record_id,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Finish a record this user created once the store shows it activated
    /// or expired. Returns whether a key was installed.
    pub(crate) async fn complete_own(&self, record_id: KeyRecordId) -> Result<bool, ExchangeError> {
        let Some(_guard) = SetGuard::acquire(&self.inner.completing, record_id) else {
            return Ok(false);
        };
        let inner = &self.inner;
        let Some(record) = inner.deps.store.get(record_id).await? else {
            inner.awaiting.remove(&record_id);
            return Ok(false);
        };
        let me = self.user_id();
        if record.responder_id != me {
            return Err(ExchangeError::NotParticipant {
                user: me,
                record: record_id,
            });
        }

        match record.status {
            KeyStatus::Pending => Ok(false),
            KeyStatus::Active => {
                inner.awaiting.remove(&record_id);
                if let Some(key) = inner.cache.take_pending(&record_id)? {
                    return self.install_record_key(&record, key);
                }
                if inner.cache.keys(&record.chat_id)?.find(&record_id).is_some() {
                    return Ok(false);
                }
                tracing::warn!(
                    chat_id = %record.chat_id,
                    record_id = %record_id,
                    "key material for own record is gone, replacing the record"
                );
                let peer = record.initiator_id;
                self.create_record(record.chat_id, peer, Some(record_id)).await?;
                Ok(false)
            }
            KeyStatus::Expired => {
                self.on_record_expired(&record)?;
                Ok(false)
            }
        }
    }

    pub(crate) fn on_record_expired(&self, record: &KeyRecord) -> Result<(), ExchangeError> {
        let inner = &self.inner;
        let was_awaiting = inner.awaiting.remove(&record.id).is_some();
        if was_awaiting {
            inner.cache.take_pending(&record.id)?;
        }
        let retired = inner.cache.retire(&record.chat_id, &record.id)?;
        if was_awaiting || retired {
            tracing::debug!(
                chat_id = %record.chat_id,
                record_id = %record.id,
                "key record expired"
            );
            self.emit(ExchangeEvent::Expired {
                chat_id: record.chat_id,
                record_id: record.id,
            });
        }
        Ok(())
    }

    fn install_record_key(
        &self,
        record: &KeyRecord,
        key: MessageKey,
    ) -> Result<bool, ExchangeError> {
        let cached = CachedKey {
            record_id: record.id,
            key,
            activated_at: record.activated_at.unwrap_or_else(Utc::now),
            expires_at: record.expires_at,
        };
        let installed = self.inner.cache.install(&record.chat_id, cached)?;
        if installed == Installed::Unchanged {
            return Ok(false);
        }
        self.inner.delivery_failed.remove(&record.chat_id);
        tracing::info!(chat_id = %record.chat_id, record_id = %record.id, "key activated");
        self.emit(ExchangeEvent::Activated {
            chat_id: record.chat_id,
            record_id: record.id,
        });
        Ok(true)
    }

    /// The cached active key, reconciling with the store when there is none.
    async fn current_key(&self, chat_id: ChatId) -> Result<Option<CachedKey>, ExchangeError> {
        if let Some(active) = self.inner.cache.active_key(&chat_id, Utc::now())? {
            return Ok(Some(active));
        }
        self.sync_chat(chat_id).await?;
        Ok(self.inner.cache.active_key(&chat_id, Utc::now())?)
    }

    pub async fn get_active_key(
        &self,
        chat_id: ChatId,
    ) -> Result<Option<MessageKey>, ExchangeError> {
        Ok(self.current_key(chat_id).await?.map(|cached| cached.key))
    }

    /// Encrypt under the chat's active key. Without one, an exchange is
    /// started and [`ExchangeError::KeyPending`] returned.
    pub async fn encrypt_for_send(
        &self,
        chat_id: ChatId,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, ExchangeError> {
        self.peer_of(chat_id)?;
        if let Some(active) = self.current_key(chat_id).await? {
            return Ok(EncryptedMessage::seal(&chat_id, active.record_id, &active.key, plaintext)?);
        }
        let record_id = self.initiate_exchange(chat_id).await?;
        tracing::debug!(
            chat_id = %chat_id,
            record_id = %record_id,
            "no active key, exchange under way"
        );
        Err(ExchangeError::KeyPending(chat_id))
    }

    pub async fn decrypt_received(
        &self,
        chat_id: ChatId,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>, DecryptError> {
        match self.inner.cache.decrypt(&chat_id, message) {
            Err(DecryptError::NoMatchingKey) => {
                // The sender may already use a key this client has not installed.
                if let Err(e) = self.sync_chat(chat_id).await {
                    tracing::debug!(chat_id = %chat_id, error = %e, "resync before retry failed");
                }
                self.inner.cache.decrypt(&chat_id, message)
            }
            other => other,
        }
    }

    pub async fn key_status(&self, chat_id: ChatId) -> Result<KeyStatusView, ExchangeError> {
        Ok(self
            .inner
            .deps
            .store
            .latest_record(chat_id)
            .await?
            .map(|record| KeyStatusView::from(&record))
            .unwrap_or_else(KeyStatusView::none))
    }

    /// Map a decrypt result to what the UI should show.
    pub async fn display_state(
        &self,
        chat_id: ChatId,
        result: &Result<Vec<u8>, DecryptError>,
    ) -> MessageDisplay {
        match result {
            Ok(bytes) => MessageDisplay::Plaintext {
                text: String::from_utf8_lossy(bytes).into_owned(),
            },
            Err(DecryptError::NoMatchingKey) => {
                if self.inner.delivery_failed.contains(&chat_id) {
                    return MessageDisplay::TransportDelayed;
                }
                match self.key_status(chat_id).await {
                    Ok(view) if view.status == Some(KeyStatus::Pending) => {
                        MessageDisplay::KeyPending
                    }
                    _ => MessageDisplay::Undecryptable {
                        reason: DecryptError::NoMatchingKey.to_string(),
                    },
                }
            }
            Err(e) => MessageDisplay::Undecryptable {
                reason: e.to_string(),
            },
        }
    }

    pub async fn handle_signal(&self, signal: Signal) -> Result<(), ExchangeError> {
        tracing::debug!(kind = signal.kind(), chat_id = %signal.chat_id(), "signal received");
        match signal {
            Signal::KeyNotify { record_id, .. } => self.acknowledge(record_id).await,
            Signal::Ack { record_id, .. } => self.complete_own(record_id).await.map(|_| ()),
            Signal::RotateRequest { chat_id } => {
                let outcome = self.rotate_on_request(chat_id).await?;
                tracing::debug!(chat_id = %chat_id, ?outcome, "rotation requested by peer");
                Ok(())
            }
        }
    }
}

impl Created {
    pub(crate) fn id(self) -> KeyRecordId {
        match self {
            Created::New(id) | Created::Existing(id) => id,
        }
    }
}

fn spawn_listener(service: &KeyExchangeService) -> tokio::task::JoinHandle<()> {
    let weak = service.downgrade();
    let user = service.user_id();
    let relay = service.inner.deps.relay.clone();
    let retry = service.inner.config.poll_initial();

    tokio::spawn(async move {
        loop {
            let mut signals = relay.subscribe(user).await;
            match weak.upgrade() {
                // A fresh subscription may have missed signals; poll now.
                Some(inner) => inner.nudge.notify_one(),
                None => return,
            }
            while let Some(signal) = signals.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let service = KeyExchangeService { inner };
                if let Err(e) = service.handle_signal(signal).await {
                    tracing::warn!(kind = signal.kind(), error = %e, "failed to handle signal");
                }
            }
            tracing::warn!(user_id = %user, "relay subscription closed, resubscribing");
            tokio::time::sleep(retry).await;
        }
    })
}
