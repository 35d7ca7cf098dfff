//! Error types for the chatkey-crypto crate.

use thiserror::Error;

/// Errors from key handling primitives: wrapping, sealing, signing, storage.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The provided key material is invalid (wrong length, malformed, etc.).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// AEAD encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// A wrapped key could not be opened with the local private key
    /// (corrupted blob, wrong recipient, or mismatched context).
    #[error("key unwrap failed: {0}")]
    UnwrapFailed(String),

    /// The user secret did not open the sealed private key.
    #[error("wrong secret for sealed private key")]
    WrongSecret,

    /// A key record signature did not verify against the responder's key.
    #[error("invalid record signature")]
    InvalidSignature,

    /// Password-based key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// No identity has been stored yet.
    #[error("identity not initialized")]
    IdentityNotInitialized,

    /// Database storage error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// OS keychain operation failed.
    #[error("keychain error: {0}")]
    KeychainError(String),

    /// No credential found in OS keychain for the requested entry.
    #[error("keychain entry not found")]
    KeychainEntryNotFound,

    /// OS keychain is not available on this platform.
    #[error("keychain unavailable")]
    KeychainUnavailable,

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// The session-scoped key store was ended and can no longer be used.
    #[error("key session ended")]
    SessionEnded,
}

/// Errors from decrypting a message body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecryptError {
    /// The AEAD tag did not verify: the ciphertext was tampered with or the
    /// key is not the one it was sealed under.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Neither the active key nor any history entry opened the message.
    #[error("no matching key")]
    NoMatchingKey,

    /// The message is structurally invalid (bad nonce length, empty body).
    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}

impl From<rusqlite::Error> for CryptoError {
    fn from(err: rusqlite::Error) -> Self {
        CryptoError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::SerializationError(err.to_string())
    }
}

impl From<CryptoError> for chatkey_shared::error::ChatKeyError {
    fn from(err: CryptoError) -> Self {
        chatkey_shared::error::ChatKeyError::Crypto(err.to_string())
    }
}

impl From<keyring::Error> for CryptoError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::NoEntry => CryptoError::KeychainEntryNotFound,
            keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
                CryptoError::KeychainUnavailable
            }
            other => CryptoError::KeychainError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrap_and_wrong_secret_messages_are_distinct() {
        let unwrap = CryptoError::UnwrapFailed("tag mismatch".into()).to_string();
        let secret = CryptoError::WrongSecret.to_string();
        assert!(unwrap.contains("tag mismatch"));
        assert_ne!(unwrap, secret);
    }

    #[test]
    fn decrypt_errors_display() {
        assert_eq!(
            DecryptError::AuthenticationFailed.to_string(),
            "authentication failed"
        );
        assert_eq!(DecryptError::NoMatchingKey.to_string(), "no matching key");
        assert!(DecryptError::Malformed("short".into())
            .to_string()
            .contains("short"));
    }

    #[test]
    fn from_rusqlite_error_converts_to_storage_error() {
        let crypto_err: CryptoError = rusqlite::Error::QueryReturnedNoRows.into();
        match crypto_err {
            CryptoError::StorageError(_) => {}
            other => panic!("expected StorageError, got: {other:?}"),
        }
    }

    #[test]
    fn from_serde_json_error_converts_to_serialization_error() {
        let json_err = serde_json::from_str::<String>("not json").unwrap_err();
        let crypto_err: CryptoError = json_err.into();
        assert!(matches!(crypto_err, CryptoError::SerializationError(_)));
    }

    #[test]
    fn from_keyring_no_entry_converts_to_entry_not_found() {
        let crypto_err: CryptoError = keyring::Error::NoEntry.into();
        assert!(matches!(crypto_err, CryptoError::KeychainEntryNotFound));
    }

    #[test]
    fn from_keyring_platform_failure_converts_to_unavailable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "test");
        let crypto_err: CryptoError = keyring::Error::PlatformFailure(Box::new(io_err)).into();
        assert!(matches!(crypto_err, CryptoError::KeychainUnavailable));
    }

    #[test]
    fn from_crypto_error_for_shared_error() {
        let shared: chatkey_shared::error::ChatKeyError = CryptoError::InvalidSignature.into();
        assert!(matches!(
            shared,
            chatkey_shared::error::ChatKeyError::Crypto(_)
        ));
    }
}
