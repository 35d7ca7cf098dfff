//! Secret-derived keys for local encryption at rest.
//!
//! Two consumers share the Argon2id derivation here: the sealed identity
//! private key (see `identity`) and the SQLCipher key of the persistent
//! key store, whose 32-byte master key comes either from the OS keychain or
//! from a user passphrase and is expanded with HKDF-SHA256.

use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

const KEYCHAIN_SERVICE: &str = "dev.chatkey.keystore";
const DB_KEY_INFO: &[u8] = b"chatkey-keystore-db-v1";

pub const SALT_SIZE: usize = 16;

// Argon2id parameters: 64 MiB memory, 3 passes, 4 lanes.
const ARGON2_MEMORY_KIB: u32 = 65536;
const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_PARALLELISM: u32 = 4;

/// A 32-byte master key, securely wiped from memory on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; 32],
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl MasterKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// Hex-encoded database key formatted for SQLCipher's `PRAGMA key`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DbEncryptionKey {
    hex: String,
}

impl std::fmt::Debug for DbEncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbEncryptionKey")
            .field("hex", &"[REDACTED]")
            .finish()
    }
}

impl DbEncryptionKey {
    /// Returns the full `x'...'` string for use in PRAGMA statements.
    pub fn as_pragma_value(&self) -> &str {
        &self.hex
    }
}

/// Stretch a user secret into 32 bytes of key material with Argon2id.
pub fn derive_from_secret(secret: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    if salt.len() < SALT_SIZE {
        return Err(CryptoError::KeyDerivation("salt too short".into()));
    }

    let params = argon2::Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_PARALLELISM,
        Some(32),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(secret, salt, output.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(output)
}

/// Generate a random salt for secret derivation.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::rng().fill_bytes(&mut salt);
    salt
}

/// Retrieve or create the key-store master key for `account` in the OS keychain.
pub fn master_key_from_keychain(account: &str) -> Result<MasterKey, CryptoError> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, account)
        .map_err(|_| CryptoError::KeychainUnavailable)?;

    match entry.get_password() {
        Ok(mut hex_string) => {
            let decoded = hex_decode(&hex_string);
            hex_string.zeroize();
            let mut bytes = decoded.ok_or_else(|| {
                CryptoError::KeychainError("malformed master key in keychain".into())
            })?;
            if bytes.len() != 32 {
                bytes.zeroize();
                return Err(CryptoError::KeychainError(
                    "malformed master key in keychain".into(),
                ));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            bytes.zeroize();
            Ok(MasterKey { key })
        }
        Err(keyring::Error::NoEntry) => {
            tracing::info!(account, "creating key-store master key in keychain");
            let mut key = [0u8; 32];
            rand::rng().fill_bytes(&mut key);
            let mut hex_string = hex_encode(&key);
            let stored = entry.set_password(&hex_string).map_err(CryptoError::from);
            hex_string.zeroize();
            stored?;
            Ok(MasterKey { key })
        }
        Err(e) => Err(CryptoError::from(e)),
    }
}

/// Derive the key-store master key from a passphrase and salt.
pub fn master_key_from_passphrase(passphrase: &str, salt: &[u8]) -> Result<MasterKey, CryptoError> {
    let derived = derive_from_secret(passphrase.as_bytes(), salt)?;
    Ok(MasterKey { key: *derived })
}

/// Derive the SQLCipher key from a master key via HKDF-SHA256.
pub fn derive_db_encryption_key(master_key: &MasterKey) -> Result<DbEncryptionKey, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, master_key.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(DB_KEY_INFO, okm.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

    let mut hex_str = hex_encode(okm.as_ref());
    let result = DbEncryptionKey {
        hex: format!("x'{hex_str}'"),
    };
    hex_str.zeroize();
    Ok(result)
}

/// Apply a SQLCipher key to a connection and confirm it opens the database.
///
/// A key that does not match an existing file surfaces as
/// [`CryptoError::WrongSecret`].
pub fn apply_encryption_key(
    conn: &rusqlite::Connection,
    db_key: &DbEncryptionKey,
) -> Result<(), CryptoError> {
    // The x'...' form is a SQL literal; binding it as a parameter would make
    // SQLCipher treat it as a passphrase and run its own KDF over it.
    conn.execute_batch(&format!("PRAGMA key = \"{}\";", db_key.as_pragma_value()))?;

    let cipher_version: String = conn
        .pragma_query_value(None, "cipher_version", |row| row.get(0))
        .map_err(|_| CryptoError::StorageError("SQLCipher not available".into()))?;
    if cipher_version.is_empty() {
        return Err(CryptoError::StorageError("SQLCipher not available".into()));
    }

    match conn.execute_batch("SELECT count(*) FROM sqlite_master") {
        Ok(()) => {}
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.extended_code == 26 => {
            return Err(CryptoError::WrongSecret);
        }
        Err(e) => return Err(e.into()),
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

// Not constant-time; only used for local keychain encoding.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| s.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passphrase_key(passphrase: &str, salt: &[u8]) -> MasterKey {
        master_key_from_passphrase(passphrase, salt).unwrap()
    }

    #[test]
    fn same_passphrase_and_salt_are_deterministic() {
        let a = passphrase_key("same-pass", &[1u8; 16]);
        let b = passphrase_key("same-pass", &[1u8; 16]);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_passphrase_or_salt_changes_key() {
        let base = passphrase_key("pass-a", &[2u8; 16]);
        let other_pass = passphrase_key("pass-b", &[2u8; 16]);
        let other_salt = passphrase_key("pass-a", &[3u8; 16]);
        assert_ne!(base.as_bytes(), other_pass.as_bytes());
        assert_ne!(base.as_bytes(), other_salt.as_bytes());
    }

    #[test]
    fn short_salt_is_rejected() {
        let result = derive_from_secret(b"pass", &[0u8; 8]);
        assert!(matches!(result, Err(CryptoError::KeyDerivation(_))));
    }

    #[test]
    fn db_key_has_sqlcipher_literal_form() {
        let mk = passphrase_key("test", &[5u8; 16]);
        let db_key = derive_db_encryption_key(&mk).unwrap();
        let val = db_key.as_pragma_value();
        assert!(val.starts_with("x'"));
        assert!(val.ends_with('\''));
        // x'<64 hex chars>'
        assert_eq!(val.len(), 67);
    }

    #[test]
    fn apply_encryption_key_enables_read_write() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let db_key = derive_db_encryption_key(&passphrase_key("rw", &[6u8; 16])).unwrap();
        apply_encryption_key(&conn, &db_key).unwrap();
        conn.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('ok');")
            .unwrap();
        let v: String = conn.query_row("SELECT v FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(v, "ok");
    }

    #[test]
    fn wrong_key_is_reported_as_wrong_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            let key = derive_db_encryption_key(&passphrase_key("right", &[7u8; 16])).unwrap();
            apply_encryption_key(&conn, &key).unwrap();
            conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY)")
                .unwrap();
        }
        let conn = rusqlite::Connection::open(&path).unwrap();
        let key = derive_db_encryption_key(&passphrase_key("wrong", &[7u8; 16])).unwrap();
        assert!(matches!(
            apply_encryption_key(&conn, &key),
            Err(CryptoError::WrongSecret)
        ));
    }

    #[test]
    fn debug_output_is_redacted() {
        let mk = passphrase_key("debug", &[8u8; 16]);
        assert!(format!("{mk:?}").contains("REDACTED"));
        let db_key = derive_db_encryption_key(&mk).unwrap();
        assert!(format!("{db_key:?}").contains("REDACTED"));
    }

    #[test]
    fn hex_helpers_round_trip() {
        let bytes = [0x00, 0x7f, 0xff, 0x10];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("abc").is_none());
        assert!(hex_decode("zz").is_none());
    }

    #[test]
    fn salts_are_random() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
