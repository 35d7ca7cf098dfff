//! The per-chat symmetric message key.

use chatkey_shared::constants::MESSAGE_KEY_SIZE;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// A 32-byte AES-256 message key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey {
    key: [u8; MESSAGE_KEY_SIZE],
}

impl MessageKey {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; MESSAGE_KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self { key }
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_KEY_SIZE]) -> Self {
        Self { key: bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; MESSAGE_KEY_SIZE] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "message key must be {MESSAGE_KEY_SIZE} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { key })
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_KEY_SIZE] {
        &self.key
    }
}

impl PartialEq for MessageKey {
    fn eq(&self, other: &Self) -> bool {
        self.key.ct_eq(&other.key).into()
    }
}

impl Eq for MessageKey {}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        assert_ne!(MessageKey::generate(), MessageKey::generate());
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(matches!(
            MessageKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKey(_))
        ));
        let key = MessageKey::from_slice(&[7u8; 32]).unwrap();
        assert_eq!(key.as_bytes(), &[7u8; 32]);
    }

    #[test]
    fn debug_is_redacted() {
        let key = MessageKey::from_bytes([0xAB; 32]);
        let debug = format!("{key:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("171"));
    }

    #[test]
    fn clone_compares_equal() {
        let key = MessageKey::generate();
        assert_eq!(key.clone(), key);
    }
}
