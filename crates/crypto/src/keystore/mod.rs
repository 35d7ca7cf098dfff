//! Client-side storage for unwrapped chat keys.
//!
//! The lifetime of cached keys is a property of the backend: an instance
//! store dies with its owner, a session store lives until the session is
//! explicitly ended, a persistent store survives restarts on an encrypted
//! SQLCipher file.

mod memory;
mod persistent;
mod session;

pub use memory::MemoryKeyStore;
pub use persistent::PersistentKeyStore;
pub use session::{SessionKeyStore, SessionKeys};

use std::collections::VecDeque;

use chatkey_shared::api::base64_serde;
use chatkey_shared::ids::{ChatId, KeyRecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::key::MessageKey;

/// How long a backend keeps its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLifetime {
    Instance,
    Session,
    Persistent,
}

/// An unwrapped key plus the record metadata the cache needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedKey {
    pub record_id: KeyRecordId,
    pub key: MessageKey,
    pub activated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Per-chat key state: the active key and older keys, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatKeys {
    pub active: Option<CachedKey>,
    pub history: VecDeque<CachedKey>,
}

impl ChatKeys {
    /// Find a cached key by record id, active first.
    pub fn find(&self, record_id: &KeyRecordId) -> Option<&CachedKey> {
        self.active
            .iter()
            .chain(self.history.iter())
            .find(|k| &k.record_id == record_id)
    }

    /// Active key followed by history, newest first.
    pub fn candidates(&self) -> impl Iterator<Item = &CachedKey> {
        self.active.iter().chain(self.history.iter())
    }
}

// Serialized form for the persistent backend.
#[derive(Serialize, Deserialize)]
struct StoredKey {
    record_id: KeyRecordId,
    #[serde(with = "base64_serde")]
    key: Vec<u8>,
    activated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize)]
struct StoredChatKeys {
    active: Option<StoredKey>,
    history: Vec<StoredKey>,
}

impl From<&CachedKey> for StoredKey {
    fn from(k: &CachedKey) -> Self {
        Self {
            record_id: k.record_id,
            key: k.key.as_bytes().to_vec(),
            activated_at: k.activated_at,
            expires_at: k.expires_at,
        }
    }
}

impl TryFrom<StoredKey> for CachedKey {
    type Error = CryptoError;

    fn try_from(mut stored: StoredKey) -> Result<Self, Self::Error> {
        let key = MessageKey::from_slice(&stored.key);
        zeroize::Zeroize::zeroize(&mut stored.key);
        Ok(Self {
            record_id: stored.record_id,
            key: key?,
            activated_at: stored.activated_at,
            expires_at: stored.expires_at,
        })
    }
}

impl ChatKeys {
    pub(crate) fn to_bytes(&self) -> Result<zeroize::Zeroizing<Vec<u8>>, CryptoError> {
        let stored = StoredChatKeys {
            active: self.active.as_ref().map(StoredKey::from),
            history: self.history.iter().map(StoredKey::from).collect(),
        };
        Ok(zeroize::Zeroizing::new(serde_json::to_vec(&stored)?))
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let stored: StoredChatKeys = serde_json::from_slice(bytes)?;
        Ok(Self {
            active: stored.active.map(CachedKey::try_from).transpose()?,
            history: stored
                .history
                .into_iter()
                .map(CachedKey::try_from)
                .collect::<Result<_, _>>()?,
        })
    }
}

/// Backend for cached chat keys and for keys awaiting activation.
///
/// Pending keys are stashed by the responder, who generated the key and has
/// no wrapped copy of its own, until the record activates.
pub trait KeyStore: Send + Sync {
    fn lifetime(&self) -> StoreLifetime;

    fn load(&self, chat_id: &ChatId) -> Result<Option<ChatKeys>, CryptoError>;

    fn save(&self, chat_id: &ChatId, keys: &ChatKeys) -> Result<(), CryptoError>;

    fn remove(&self, chat_id: &ChatId) -> Result<(), CryptoError>;

    fn stash_pending(&self, record_id: &KeyRecordId, key: &MessageKey) -> Result<(), CryptoError>;

    fn take_pending(&self, record_id: &KeyRecordId) -> Result<Option<MessageKey>, CryptoError>;

    /// Records that still have a stashed pending key.
    fn pending_ids(&self) -> Result<Vec<KeyRecordId>, CryptoError>;
}

pub(crate) fn poisoned<T>(_: std::sync::PoisonError<T>) -> CryptoError {
    CryptoError::StorageError("key store lock poisoned".into())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Duration;

    pub fn cached(days_ago: i64) -> CachedKey {
        let activated_at = Utc::now() - Duration::days(days_ago);
        CachedKey {
            record_id: KeyRecordId::new(),
            key: MessageKey::generate(),
            activated_at,
            expires_at: activated_at + Duration::days(7),
        }
    }

    /// Behaviour every backend must share.
    pub fn exercise_store(store: &dyn KeyStore) {
        let chat = ChatId::new();
        assert!(store.load(&chat).unwrap().is_none());

        let mut keys = ChatKeys {
            active: Some(cached(0)),
            history: VecDeque::new(),
        };
        keys.history.push_back(cached(2));
        store.save(&chat, &keys).unwrap();
        assert_eq!(store.load(&chat).unwrap().unwrap(), keys);

        store.remove(&chat).unwrap();
        assert!(store.load(&chat).unwrap().is_none());

        let record = KeyRecordId::new();
        let key = MessageKey::generate();
        store.stash_pending(&record, &key).unwrap();
        assert_eq!(store.pending_ids().unwrap(), vec![record]);
        assert_eq!(store.take_pending(&record).unwrap().unwrap(), key);
        assert!(store.take_pending(&record).unwrap().is_none());
        assert!(store.pending_ids().unwrap().is_empty());
    }
}
