//! Client key cache: the active key per chat plus a short history of
//! superseded keys for decrypting older messages.

use std::sync::{Arc, Mutex};

use chatkey_crypto::cipher::EncryptedMessage;
use chatkey_crypto::error::{CryptoError, DecryptError};
use chatkey_crypto::key::MessageKey;
use chatkey_crypto::keystore::{CachedKey, ChatKeys, KeyStore};
use chatkey_shared::ids::{ChatId, KeyRecordId};
use chrono::{DateTime, Utc};

/// Result of offering a key to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    /// The key became the chat's active key.
    Active,
    /// An older key than the current active one; filed into history.
    History,
    /// Already cached.
    Unchanged,
}

pub struct KeyCache {
    store: Arc<dyn KeyStore>,
    history_cap: usize,
    // Serializes load-modify-save cycles against the backend.
    write_lock: Mutex<()>,
}

impl KeyCache {
    pub fn new(store: Arc<dyn KeyStore>, history_cap: usize) -> Self {
        Self {
            store,
            history_cap,
            write_lock: Mutex::new(()),
        }
    }

    pub fn keys(&self, chat_id: &ChatId) -> Result<ChatKeys, CryptoError> {
        Ok(self.store.load(chat_id)?.unwrap_or_default())
    }

    fn update<T>(
        &self,
        chat_id: &ChatId,
        f: impl FnOnce(&mut ChatKeys) -> T,
    ) -> Result<T, CryptoError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CryptoError::StorageError("key cache lock poisoned".into()))?;
        let mut keys = self.keys(chat_id)?;
        let before = keys.clone();
        let out = f(&mut keys);
        if keys != before {
            self.store.save(chat_id, &keys)?;
        }
        Ok(out)
    }

    /// The active key, retiring it to history first if it has expired.
    pub fn active_key(
        &self,
        chat_id: &ChatId,
        now: DateTime<Utc>,
    ) -> Result<Option<CachedKey>, CryptoError> {
        let cap = self.history_cap;
        self.update(chat_id, |keys| {
            if keys.active.as_ref().is_some_and(|k| k.is_expired(now)) {
                if let Some(expired) = keys.active.take() {
                    tracing::debug!(
                        chat_id = %chat_id,
                        record_id = %expired.record_id,
                        "retired expired key"
                    );
                    push_history(keys, expired, cap);
                }
            }
            keys.active.clone()
        })
    }

    /// Install a newly activated key. The previous active key moves to
    /// history; entries beyond the cap are dropped.
    pub fn install(&self, chat_id: &ChatId, key: CachedKey) -> Result<Installed, CryptoError> {
        let cap = self.history_cap;
        self.update(chat_id, |keys| {
            if keys.find(&key.record_id).is_some() {
                return Installed::Unchanged;
            }
            match keys.active.take() {
                Some(current) if current.activated_at > key.activated_at => {
                    keys.active = Some(current);
                    insert_history_sorted(keys, key, cap);
                    Installed::History
                }
                Some(current) => {
                    push_history(keys, current, cap);
                    keys.active = Some(key);
                    Installed::Active
                }
                None => {
                    keys.active = Some(key);
                    Installed::Active
                }
            }
        })
    }

    /// Move the active key to history if it belongs to `record_id`.
    pub fn retire(&self, chat_id: &ChatId, record_id: &KeyRecordId) -> Result<bool, CryptoError> {
        let cap = self.history_cap;
        self.update(chat_id, |keys| {
            if keys.active.as_ref().map(|k| &k.record_id) != Some(record_id) {
                return false;
            }
            if let Some(old) = keys.active.take() {
                push_history(keys, old, cap);
            }
            true
        })
    }

    /// Drop every cached key of the chat, active and history.
    pub fn forget(&self, chat_id: &ChatId) -> Result<(), CryptoError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CryptoError::StorageError("key cache lock poisoned".into()))?;
        self.store.remove(chat_id)
    }

    pub fn stash_pending(
        &self,
        record_id: &KeyRecordId,
        key: &MessageKey,
    ) -> Result<(), CryptoError> {
        self.store.stash_pending(record_id, key)
    }

    pub fn take_pending(&self, record_id: &KeyRecordId) -> Result<Option<MessageKey>, CryptoError> {
        self.store.take_pending(record_id)
    }

    pub fn pending_ids(&self) -> Result<Vec<KeyRecordId>, CryptoError> {
        self.store.pending_ids()
    }

    /// Decrypt with the cached keys.
    ///
    /// When the message names a cached key, only that key is tried and a
    /// failure is an authentication failure. Otherwise the active key and
    /// then history are tried newest first.
    pub fn decrypt(
        &self,
        chat_id: &ChatId,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>, DecryptError> {
        let keys = self.keys(chat_id).map_err(|e| {
            tracing::error!(chat_id = %chat_id, error = %e, "key store unavailable during decrypt");
            DecryptError::NoMatchingKey
        })?;

        if let Some(named) = keys.find(&message.key_id) {
            return message.open(chat_id, &named.key);
        }

        for candidate in keys.candidates() {
            match message.open(chat_id, &candidate.key) {
                Ok(plaintext) => return Ok(plaintext),
                Err(DecryptError::Malformed(reason)) => {
                    return Err(DecryptError::Malformed(reason))
                }
                Err(_) => continue,
            }
        }
        Err(DecryptError::NoMatchingKey)
    }
}

fn push_history(keys: &mut ChatKeys, key: CachedKey, cap: usize) {
    keys.history.push_front(key);
    keys.history.truncate(cap);
}

fn insert_history_sorted(keys: &mut ChatKeys, key: CachedKey, cap: usize) {
    let pos = keys
        .history
        .iter()
        .position(|k| k.activated_at < key.activated_at)
        .unwrap_or(keys.history.len());
    keys.history.insert(pos, key);
    keys.history.truncate(cap);
}
