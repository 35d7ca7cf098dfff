use std::path::Path;
use std::sync::Mutex;

use chatkey_shared::ids::{ChatId, KeyRecordId};
use rusqlite::Connection;

use super::{poisoned, ChatKeys, KeyStore, StoreLifetime};
use crate::error::CryptoError;
use crate::key::MessageKey;
use crate::master_key::{
    apply_encryption_key, derive_db_encryption_key, master_key_from_keychain, MasterKey,
};
use crate::storage::migrations::run_crypto_migrations;
use crate::storage::CryptoStore;

/// Keys that survive restarts, in a SQLCipher database.
///
/// The same file also holds the sealed identity (see
/// [`crate::storage::identity_store`]), reachable through [`Self::with_connection`].
pub struct PersistentKeyStore {
    conn: Mutex<Connection>,
}

impl PersistentKeyStore {
    /// Open (or create) the encrypted database at `path`.
    pub fn open(path: &Path, master_key: &MasterKey) -> Result<Self, CryptoError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, master_key)
    }

    /// Open the database at `path` with the master key kept in the OS
    /// keychain under `account`, creating the key on first use.
    pub fn open_with_keychain(path: &Path, account: &str) -> Result<Self, CryptoError> {
        let master_key = master_key_from_keychain(account)?;
        Self::open(path, &master_key)
    }

    pub fn open_in_memory(master_key: &MasterKey) -> Result<Self, CryptoError> {
        Self::from_connection(Connection::open_in_memory()?, master_key)
    }

    fn from_connection(conn: Connection, master_key: &MasterKey) -> Result<Self, CryptoError> {
        let db_key = derive_db_encryption_key(master_key)?;
        apply_encryption_key(&conn, &db_key)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        run_crypto_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` against the underlying connection.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let conn = self.conn.lock().map_err(poisoned)?;
        f(&conn)
    }
}

impl KeyStore for PersistentKeyStore {
    fn lifetime(&self) -> StoreLifetime {
        StoreLifetime::Persistent
    }

    fn load(&self, chat_id: &ChatId) -> Result<Option<ChatKeys>, CryptoError> {
        let bytes = self.with_connection(|conn| CryptoStore::new(conn).get_chat_keys(chat_id))?;
        let bytes = bytes.map(zeroize::Zeroizing::new);
        bytes.map(|b| ChatKeys::from_bytes(&b)).transpose()
    }

    fn save(&self, chat_id: &ChatId, keys: &ChatKeys) -> Result<(), CryptoError> {
        let bytes = keys.to_bytes()?;
        self.with_connection(|conn| CryptoStore::new(conn).put_chat_keys(chat_id, &bytes))
    }

    fn remove(&self, chat_id: &ChatId) -> Result<(), CryptoError> {
        self.with_connection(|conn| CryptoStore::new(conn).delete_chat_keys(chat_id))
    }

    fn stash_pending(&self, record_id: &KeyRecordId, key: &MessageKey) -> Result<(), CryptoError> {
        self.with_connection(|conn| {
            CryptoStore::new(conn).put_pending_key(record_id, key.as_bytes())
        })
    }

    fn take_pending(&self, record_id: &KeyRecordId) -> Result<Option<MessageKey>, CryptoError> {
        let bytes =
            self.with_connection(|conn| CryptoStore::new(conn).take_pending_key(record_id))?;
        bytes
            .map(zeroize::Zeroizing::new)
            .map(|b| MessageKey::from_slice(&b))
            .transpose()
    }

    fn pending_ids(&self) -> Result<Vec<KeyRecordId>, CryptoError> {
        self.with_connection(|conn| CryptoStore::new(conn).pending_key_ids())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::test_support::{cached, exercise_store};
    use crate::master_key::master_key_from_passphrase;

    fn master(pass: &str) -> MasterKey {
        master_key_from_passphrase(pass, &[4u8; 16]).unwrap()
    }

    #[test]
    fn persistent_store_behaves_like_a_key_store() {
        let store = PersistentKeyStore::open_in_memory(&master("mem")).unwrap();
        assert_eq!(store.lifetime(), StoreLifetime::Persistent);
        exercise_store(&store);
    }

    #[test]
    fn keys_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let chat = ChatId::new();
        let keys = ChatKeys {
            active: Some(cached(0)),
            history: Default::default(),
        };

        {
            let store = PersistentKeyStore::open(&path, &master("disk")).unwrap();
            store.save(&chat, &keys).unwrap();
        }

        let reopened = PersistentKeyStore::open(&path, &master("disk")).unwrap();
        assert_eq!(reopened.load(&chat).unwrap().unwrap(), keys);
    }

    #[test]
    fn wrong_master_key_cannot_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        {
            let store = PersistentKeyStore::open(&path, &master("right")).unwrap();
            store.save(&ChatId::new(), &ChatKeys::default()).unwrap();
        }
        assert!(matches!(
            PersistentKeyStore::open(&path, &master("wrong")),
            Err(CryptoError::WrongSecret)
        ));
    }

    #[test]
    fn store_opens_with_keychain_master_key() {
        keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let chat = ChatId::new();

        let store = PersistentKeyStore::open_with_keychain(&path, "alice@device").unwrap();
        store.save(&chat, &ChatKeys::default()).unwrap();
        assert_eq!(store.load(&chat).unwrap().unwrap(), ChatKeys::default());
    }

    #[test]
    fn key_bytes_are_not_plaintext_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let key = cached(0);
        {
            let store = PersistentKeyStore::open(&path, &master("disk")).unwrap();
            store
                .save(
                    &ChatId::new(),
                    &ChatKeys {
                        active: Some(key.clone()),
                        history: Default::default(),
                    },
                )
                .unwrap();
        }
        let raw = std::fs::read(&path).unwrap();
        assert!(!raw.windows(32).any(|w| w == key.key.as_bytes()));
    }
}
