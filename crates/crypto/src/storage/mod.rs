//! Local encrypted storage for identity and client key state.
//!
//! [`CryptoStore`] borrows a connection that already has the SQLCipher key
//! applied and migrations run; it owns no locking of its own.

pub mod identity_store;
pub mod migrations;

use chatkey_shared::ids::{ChatId, KeyRecordId};
use rusqlite::{Connection, OptionalExtension};

use crate::error::CryptoError;

pub struct CryptoStore<'a> {
    pub(crate) conn: &'a Connection,
}

impl<'a> CryptoStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get_chat_keys(&self, chat_id: &ChatId) -> Result<Option<Vec<u8>>, CryptoError> {
        let value = self
            .conn
            .query_row(
                "SELECT keys FROM crypto_chat_keys WHERE chat_id = ?1",
                [chat_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn put_chat_keys(&self, chat_id: &ChatId, keys: &[u8]) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_chat_keys (chat_id, keys, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(chat_id) DO UPDATE
                 SET keys = excluded.keys, updated_at = excluded.updated_at",
            rusqlite::params![chat_id.to_string(), keys, now_millis()],
        )?;
        Ok(())
    }

    pub fn delete_chat_keys(&self, chat_id: &ChatId) -> Result<(), CryptoError> {
        self.conn.execute(
            "DELETE FROM crypto_chat_keys WHERE chat_id = ?1",
            [chat_id.to_string()],
        )?;
        Ok(())
    }

    pub fn put_pending_key(&self, record_id: &KeyRecordId, key: &[u8]) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO crypto_pending_keys (record_id, key, created_at)
             VALUES (?1, ?2, ?3)",
            rusqlite::params![record_id.to_string(), key, now_millis()],
        )?;
        Ok(())
    }

    /// Remove and return a stashed pending key.
    pub fn take_pending_key(
        &self,
        record_id: &KeyRecordId,
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        let id = record_id.to_string();
        let value: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT key FROM crypto_pending_keys WHERE record_id = ?1",
                [&id],
                |row| row.get(0),
            )
            .optional()?;
        if value.is_some() {
            self.conn
                .execute("DELETE FROM crypto_pending_keys WHERE record_id = ?1", [&id])?;
        }
        Ok(value)
    }

    /// Ids of every stashed pending key.
    pub fn pending_key_ids(&self) -> Result<Vec<KeyRecordId>, CryptoError> {
        let mut stmt = self
            .conn
            .prepare("SELECT record_id FROM crypto_pending_keys ORDER BY created_at")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.iter()
            .map(|id| {
                id.parse()
                    .map_err(|e| CryptoError::StorageError(format!("bad pending key id: {e}")))
            })
            .collect()
    }
}

/// Run `f` inside a transaction, committing only when it returns `Ok`.
pub fn with_transaction<T, F>(conn: &Connection, f: F) -> Result<T, CryptoError>
where
    F: FnOnce(&CryptoStore<'_>) -> Result<T, CryptoError>,
{
    let tx = conn.unchecked_transaction()?;
    let result = f(&CryptoStore::new(&tx))?;
    tx.commit()?;
    Ok(result)
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
pub(crate) fn init_test_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    migrations::run_crypto_migrations(&conn).unwrap();
    conn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_keys_upsert_and_delete() {
        let conn = init_test_db();
        let store = CryptoStore::new(&conn);
        let chat = ChatId::new();

        assert!(store.get_chat_keys(&chat).unwrap().is_none());
        store.put_chat_keys(&chat, b"one").unwrap();
        store.put_chat_keys(&chat, b"two").unwrap();
        assert_eq!(store.get_chat_keys(&chat).unwrap().unwrap(), b"two");

        store.delete_chat_keys(&chat).unwrap();
        assert!(store.get_chat_keys(&chat).unwrap().is_none());
    }

    #[test]
    fn pending_key_is_taken_once() {
        let conn = init_test_db();
        let store = CryptoStore::new(&conn);
        let record = KeyRecordId::new();

        store.put_pending_key(&record, &[9u8; 32]).unwrap();
        assert_eq!(store.take_pending_key(&record).unwrap().unwrap(), vec![9u8; 32]);
        assert!(store.take_pending_key(&record).unwrap().is_none());
    }

    #[test]
    fn pending_key_ids_lists_stashed_records() {
        let conn = init_test_db();
        let store = CryptoStore::new(&conn);
        let (a, b) = (KeyRecordId::new(), KeyRecordId::new());
        store.put_pending_key(&a, &[1u8; 32]).unwrap();
        store.put_pending_key(&b, &[2u8; 32]).unwrap();

        let mut ids = store.pending_key_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![a, b]);

        store.take_pending_key(&a).unwrap();
        assert_eq!(store.pending_key_ids().unwrap(), vec![b]);
    }

    #[test]
    fn with_transaction_rolls_back_on_error() {
        let conn = init_test_db();
        let chat = ChatId::new();
        let result: Result<(), CryptoError> = with_transaction(&conn, |store| {
            store.put_chat_keys(&chat, b"doomed")?;
            Err(CryptoError::StorageError("abort".into()))
        });
        assert!(result.is_err());
        assert!(CryptoStore::new(&conn).get_chat_keys(&chat).unwrap().is_none());
    }
}
