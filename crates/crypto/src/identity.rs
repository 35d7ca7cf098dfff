//! User identity keys.
//!
//! An identity is two keypairs: X25519 for receiving wrapped message keys and
//! Ed25519 for signing key records. The private halves only leave memory in
//! sealed form, encrypted under a key stretched from the user's secret.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use chatkey_shared::api::base64_serde;
use chatkey_shared::ids::UserId;
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::cipher::NONCE_SIZE;
use crate::error::CryptoError;
use crate::key::MessageKey;
use crate::master_key::{derive_from_secret, generate_salt};
use crate::signature::{self, RecordFields};
use crate::wrap;

const SEAL_AAD_LABEL: &[u8] = b"chatkey-identity-v1";

/// The shareable half of an identity, as published to the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIdentity {
    #[serde(with = "base64_serde")]
    pub exchange_key: Vec<u8>,
    #[serde(with = "base64_serde")]
    pub verifying_key: Vec<u8>,
}

impl PublicIdentity {
    pub fn exchange_public(&self) -> Result<PublicKey, CryptoError> {
        let bytes: [u8; 32] = self.exchange_key.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "exchange key must be 32 bytes, got {}",
                self.exchange_key.len()
            ))
        })?;
        Ok(PublicKey::from(bytes))
    }

    pub fn verifying(&self) -> Result<VerifyingKey, CryptoError> {
        let bytes: [u8; 32] = self.verifying_key.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "verifying key must be 32 bytes, got {}",
                self.verifying_key.len()
            ))
        })?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))
    }

    /// Wrap a message key for the owner of this identity.
    pub fn wrap_key(&self, key: &MessageKey, context: &[u8]) -> Result<Vec<u8>, CryptoError> {
        wrap::wrap(key, &self.exchange_public()?, context)
    }

    pub fn verify_record(&self, fields: RecordFields<'_>, sig: &[u8]) -> Result<(), CryptoError> {
        signature::verify_record(&self.verifying()?, fields, sig)
    }
}

/// Unlocked private keys. Wiped on drop and never serialized.
#[derive(Clone)]
pub struct PrivateKeyHandle {
    exchange: StaticSecret,
    signing: SigningKey,
}

impl std::fmt::Debug for PrivateKeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKeyHandle")
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

impl PrivateKeyHandle {
    fn generate() -> Self {
        let mut exchange_bytes = Zeroizing::new([0u8; 32]);
        let mut signing_bytes = Zeroizing::new([0u8; 32]);
        rand::rng().fill_bytes(exchange_bytes.as_mut());
        rand::rng().fill_bytes(signing_bytes.as_mut());
        Self {
            exchange: StaticSecret::from(*exchange_bytes),
            signing: SigningKey::from_bytes(&signing_bytes),
        }
    }

    pub fn public_identity(&self) -> PublicIdentity {
        PublicIdentity {
            exchange_key: PublicKey::from(&self.exchange).as_bytes().to_vec(),
            verifying_key: self.signing.verifying_key().to_bytes().to_vec(),
        }
    }

    /// Open a message key wrapped for this identity.
    pub fn unwrap_key(&self, wrapped: &[u8], context: &[u8]) -> Result<MessageKey, CryptoError> {
        wrap::unwrap(wrapped, &self.exchange, context)
    }

    pub fn sign_record(&self, fields: RecordFields<'_>) -> Vec<u8> {
        signature::sign_record(&self.signing, fields)
    }

    /// Seal the private keys under `secret`, binding the envelope to `user_id`.
    pub fn seal(&self, user_id: &UserId, secret: &[u8]) -> Result<SealedPrivateKey, CryptoError> {
        let salt = generate_salt();
        let seal_key = derive_from_secret(secret, &salt)?;

        let mut plaintext = Zeroizing::new([0u8; 64]);
        plaintext[..32].copy_from_slice(self.exchange.as_bytes());
        plaintext[32..].copy_from_slice(self.signing.as_bytes());

        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        let cipher = Aes256Gcm::new_from_slice(seal_key.as_ref())
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_ref(),
                    aad: &seal_aad(user_id),
                },
            )
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        Ok(SealedPrivateKey {
            salt: salt.to_vec(),
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }
}

fn seal_aad(user_id: &UserId) -> Vec<u8> {
    let mut aad = SEAL_AAD_LABEL.to_vec();
    aad.extend_from_slice(user_id.as_bytes());
    aad
}

/// The private keys encrypted at rest. Argon2id over the user secret derives
/// the AES-256-GCM key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedPrivateKey {
    #[serde(with = "base64_serde")]
    pub salt: Vec<u8>,
    #[serde(with = "base64_serde")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_serde")]
    pub ciphertext: Vec<u8>,
}

impl SealedPrivateKey {
    /// Unlock with the user secret. A wrong secret is
    /// [`CryptoError::WrongSecret`], never a different key.
    pub fn unlock(&self, user_id: &UserId, secret: &[u8]) -> Result<PrivateKeyHandle, CryptoError> {
        if self.nonce.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidKey("sealed key nonce has wrong length".into()));
        }
        let seal_key = derive_from_secret(secret, &self.salt)?;
        let cipher = Aes256Gcm::new_from_slice(seal_key.as_ref())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&self.nonce),
                    Payload {
                        msg: &self.ciphertext,
                        aad: &seal_aad(user_id),
                    },
                )
                .map_err(|_| CryptoError::WrongSecret)?,
        );
        if plaintext.len() != 64 {
            return Err(CryptoError::InvalidKey("sealed key payload has wrong length".into()));
        }

        let mut exchange_bytes = Zeroizing::new([0u8; 32]);
        let mut signing_bytes = Zeroizing::new([0u8; 32]);
        exchange_bytes.copy_from_slice(&plaintext[..32]);
        signing_bytes.copy_from_slice(&plaintext[32..]);
        Ok(PrivateKeyHandle {
            exchange: StaticSecret::from(*exchange_bytes),
            signing: SigningKey::from_bytes(&signing_bytes),
        })
    }
}

/// A user's identity: public bundle, unlocked private handle, and the sealed
/// form that is safe to persist.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub public_key: PublicIdentity,
    pub private_key_handle: PrivateKeyHandle,
    pub sealed_private_key: SealedPrivateKey,
}

impl UserIdentity {
    /// Reopen a persisted identity. Fails with [`CryptoError::WrongSecret`]
    /// when `secret` does not match, or `InvalidKey` when the sealed keys do
    /// not belong to `public_key`.
    pub fn unlock(
        user_id: UserId,
        public_key: PublicIdentity,
        sealed: SealedPrivateKey,
        secret: &[u8],
    ) -> Result<Self, CryptoError> {
        let handle = sealed.unlock(&user_id, secret)?;
        if handle.public_identity() != public_key {
            return Err(CryptoError::InvalidKey(
                "sealed private key does not match public identity".into(),
            ));
        }
        Ok(Self {
            user_id,
            public_key,
            private_key_handle: handle,
            sealed_private_key: sealed,
        })
    }
}

/// Generate fresh keypairs for `user_id` and seal them under `secret`.
///
/// CPU-heavy (Argon2id); async callers should run it on a blocking worker.
pub fn generate_identity(user_id: UserId, secret: &[u8]) -> Result<UserIdentity, CryptoError> {
    let handle = PrivateKeyHandle::generate();
    let sealed = handle.seal(&user_id, secret)?;
    tracing::debug!(user_id = %user_id, "generated identity keypairs");
    Ok(UserIdentity {
        user_id,
        public_key: handle.public_identity(),
        private_key_handle: handle,
        sealed_private_key: sealed,
    })
}
