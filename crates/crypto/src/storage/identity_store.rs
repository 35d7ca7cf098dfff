//! Persistence for the local user identity. Only the sealed private key is
//! written; unlocking needs the user secret.

use chatkey_shared::ids::UserId;
use rusqlite::{Connection, OptionalExtension};

use crate::error::CryptoError;
use crate::identity::{PublicIdentity, SealedPrivateKey, UserIdentity};
use crate::storage::{now_millis, with_transaction, CryptoStore};

impl CryptoStore<'_> {
    fn identity_row(&self) -> Result<Option<(String, Vec<u8>, Vec<u8>)>, CryptoError> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, public_identity, sealed_private_key
                 FROM crypto_identity WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(row)
    }
}

/// Persist `identity`. Refuses to overwrite an existing identity, since that
/// would orphan every key wrapped for the old one.
pub fn save_identity(conn: &Connection, identity: &UserIdentity) -> Result<(), CryptoError> {
    let public = serde_json::to_vec(&identity.public_key)?;
    let sealed = serde_json::to_vec(&identity.sealed_private_key)?;

    with_transaction(conn, |store| {
        if store.identity_row()?.is_some() {
            return Err(CryptoError::StorageError("identity already exists".into()));
        }
        store.conn.execute(
            "INSERT INTO crypto_identity
                 (id, user_id, public_identity, sealed_private_key, created_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            rusqlite::params![identity.user_id.to_string(), public, sealed, now_millis()],
        )?;
        Ok(())
    })
}

/// Load and unlock the stored identity.
pub fn load_identity(conn: &Connection, secret: &[u8]) -> Result<UserIdentity, CryptoError> {
    let (user_id, public, sealed) = CryptoStore::new(conn)
        .identity_row()?
        .ok_or(CryptoError::IdentityNotInitialized)?;

    let user_id: UserId = user_id
        .parse()
        .map_err(|e: uuid::Error| CryptoError::SerializationError(e.to_string()))?;
    let public: PublicIdentity = serde_json::from_slice(&public)?;
    let sealed: SealedPrivateKey = serde_json::from_slice(&sealed)?;
    UserIdentity::unlock(user_id, public, sealed, secret)
}

/// The stored public identity, readable without the secret.
pub fn load_public_identity(conn: &Connection) -> Result<(UserId, PublicIdentity), CryptoError> {
    let (user_id, public, _) = CryptoStore::new(conn)
        .identity_row()?
        .ok_or(CryptoError::IdentityNotInitialized)?;
    let user_id: UserId = user_id
        .parse()
        .map_err(|e: uuid::Error| CryptoError::SerializationError(e.to_string()))?;
    Ok((user_id, serde_json::from_slice(&public)?))
}
