use std::collections::HashMap;
use std::sync::Mutex;

use chatkey_shared::ids::{ChatId, KeyRecordId};

use super::{poisoned, ChatKeys, KeyStore, StoreLifetime};
use crate::error::CryptoError;
use crate::key::MessageKey;

#[derive(Default)]
pub(crate) struct KeyMaps {
    pub(crate) chats: HashMap<ChatId, ChatKeys>,
    pub(crate) pending: HashMap<KeyRecordId, MessageKey>,
}

/// Keys held for the lifetime of this value only.
#[derive(Default)]
pub struct MemoryKeyStore {
    inner: Mutex<KeyMaps>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn lifetime(&self) -> StoreLifetime {
        StoreLifetime::Instance
    }

    fn load(&self, chat_id: &ChatId) -> Result<Option<ChatKeys>, CryptoError> {
        let maps = self.inner.lock().map_err(poisoned)?;
        Ok(maps.chats.get(chat_id).cloned())
    }

    fn save(&self, chat_id: &ChatId, keys: &ChatKeys) -> Result<(), CryptoError> {
        let mut maps = self.inner.lock().map_err(poisoned)?;
        maps.chats.insert(*chat_id, keys.clone());
        Ok(())
    }

    fn remove(&self, chat_id: &ChatId) -> Result<(), CryptoError> {
        let mut maps = self.inner.lock().map_err(poisoned)?;
        maps.chats.remove(chat_id);
        Ok(())
    }

    fn stash_pending(&self, record_id: &KeyRecordId, key: &MessageKey) -> Result<(), CryptoError> {
        let mut maps = self.inner.lock().map_err(poisoned)?;
        maps.pending.insert(*record_id, key.clone());
        Ok(())
    }

    fn take_pending(&self, record_id: &KeyRecordId) -> Result<Option<MessageKey>, CryptoError> {
        let mut maps = self.inner.lock().map_err(poisoned)?;
        Ok(maps.pending.remove(record_id))
    }

    fn pending_ids(&self) -> Result<Vec<KeyRecordId>, CryptoError> {
        let maps = self.inner.lock().map_err(poisoned)?;
        Ok(maps.pending.keys().copied().collect())
    }
}
