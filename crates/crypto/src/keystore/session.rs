use std::sync::{Arc, Mutex};

use chatkey_shared::ids::{ChatId, KeyRecordId};

use super::memory::KeyMaps;
use super::{poisoned, ChatKeys, KeyStore, StoreLifetime};
use crate::error::CryptoError;
use crate::key::MessageKey;

/// Process-session key storage shared by every store opened on it.
///
/// Keys live until [`SessionKeys::end`] is called; after that every store
/// backed by this session fails with [`CryptoError::SessionEnded`].
#[derive(Clone, Default)]
pub struct SessionKeys {
    inner: Arc<Mutex<Option<KeyMaps>>>,
}

impl SessionKeys {
    pub fn begin() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(KeyMaps::default()))),
        }
    }

    /// Drop all keys held by the session.
    pub fn end(&self) {
        match self.inner.lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(poisoned) => {
                poisoned.into_inner().take();
            }
        }
        tracing::debug!("key session ended");
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn with_maps<T>(&self, f: impl FnOnce(&mut KeyMaps) -> T) -> Result<T, CryptoError> {
        let mut guard = self.inner.lock().map_err(poisoned)?;
        let maps = guard.as_mut().ok_or(CryptoError::SessionEnded)?;
        Ok(f(maps))
    }
}

pub struct SessionKeyStore {
    session: SessionKeys,
}

impl SessionKeyStore {
    pub fn new(session: &SessionKeys) -> Self {
        Self {
            session: session.clone(),
        }
    }
}

impl KeyStore for SessionKeyStore {
    fn lifetime(&self) -> StoreLifetime {
        StoreLifetime::Session
    }

    fn load(&self, chat_id: &ChatId) -> Result<Option<ChatKeys>, CryptoError> {
        self.session.with_maps(|m| m.chats.get(chat_id).cloned())
    }

    fn save(&self, chat_id: &ChatId, keys: &ChatKeys) -> Result<(), CryptoError> {
        self.session.with_maps(|m| {
            m.chats.insert(*chat_id, keys.clone());
        })
    }

    fn remove(&self, chat_id: &ChatId) -> Result<(), CryptoError> {
        self.session.with_maps(|m| {
            m.chats.remove(chat_id);
        })
    }

    fn stash_pending(&self, record_id: &KeyRecordId, key: &MessageKey) -> Result<(), CryptoError> {
        self.session.with_maps(|m| {
            m.pending.insert(*record_id, key.clone());
        })
    }

    fn take_pending(&self, record_id: &KeyRecordId) -> Result<Option<MessageKey>, CryptoError> {
        self.session.with_maps(|m| m.pending.remove(record_id))
    }

    fn pending_ids(&self) -> Result<Vec<KeyRecordId>, CryptoError> {
        self.session.with_maps(|m| m.pending.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::test_support::exercise_store;

    #[test]
    fn session_store_behaves_like_a_key_store() {
        let session = SessionKeys::begin();
        let store = SessionKeyStore::new(&session);
        assert_eq!(store.lifetime(), StoreLifetime::Session);
        exercise_store(&store);
    }

    #[test]
    fn stores_on_one_session_share_keys() {
        let session = SessionKeys::begin();
        let first = SessionKeyStore::new(&session);
        let chat = ChatId::new();
        first.save(&chat, &ChatKeys::default()).unwrap();
        drop(first);

        let second = SessionKeyStore::new(&session);
        assert!(second.load(&chat).unwrap().is_some());
    }

    #[test]
    fn ended_session_rejects_access() {
        let session = SessionKeys::begin();
        let store = SessionKeyStore::new(&session);
        store.save(&ChatId::new(), &ChatKeys::default()).unwrap();

        session.end();
        assert!(!session.is_active());
        assert!(matches!(
            store.load(&ChatId::new()),
            Err(CryptoError::SessionEnded)
        ));
        assert!(matches!(
            store.take_pending(&KeyRecordId::new()),
            Err(CryptoError::SessionEnded)
        ));
    }

    #[test]
    fn default_session_is_not_begun() {
        let session = SessionKeys::default();
        assert!(!session.is_active());
    }
}
