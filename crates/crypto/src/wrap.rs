//! Wrapping a message key for one recipient.
//!
//! Each wrap uses a fresh ephemeral X25519 key: the shared secret with the
//! recipient's exchange key is expanded with HKDF-SHA256 into a one-time
//! AES-256-GCM key that seals the message key. The wrap context (chat id and
//! record id) is authenticated as AAD, so a wrapped key lifted into another
//! record does not open.
//!
//! Blob layout: `version (1) || ephemeral_public (32) || nonce (12) || ciphertext (48)`.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use chatkey_shared::ids::{ChatId, KeyRecordId};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::cipher::{NONCE_SIZE, TAG_SIZE};
use crate::error::CryptoError;
use crate::key::MessageKey;

const WRAP_VERSION: u8 = 1;
const WRAP_INFO: &[u8] = b"chatkey-wrap-v1";
const CONTEXT_LABEL: &[u8] = b"chatkey-record-v1";

const PUBLIC_KEY_SIZE: usize = 32;
const WRAPPED_CT_SIZE: usize = chatkey_shared::constants::MESSAGE_KEY_SIZE + TAG_SIZE;

/// Total length of a wrapped key blob.
pub const WRAPPED_KEY_SIZE: usize = 1 + PUBLIC_KEY_SIZE + NONCE_SIZE + WRAPPED_CT_SIZE;

/// Context bytes binding a wrapped key to its record.
pub fn wrap_context(chat_id: &ChatId, record_id: &KeyRecordId) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(CONTEXT_LABEL.len() + 32);
    ctx.extend_from_slice(CONTEXT_LABEL);
    ctx.extend_from_slice(chat_id.as_bytes());
    ctx.extend_from_slice(record_id.as_bytes());
    ctx
}

fn derive_wrapping_key(
    shared_secret: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut salt = [0u8; 2 * PUBLIC_KEY_SIZE];
    salt[..PUBLIC_KEY_SIZE].copy_from_slice(ephemeral_public);
    salt[PUBLIC_KEY_SIZE..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(WRAP_INFO, okm.as_mut())
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// Wrap `key` so only the holder of `recipient`'s private exchange key can open it.
pub fn wrap(
    key: &MessageKey,
    recipient: &PublicKey,
    context: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let mut eph_bytes = Zeroizing::new([0u8; 32]);
    rand::rng().fill_bytes(eph_bytes.as_mut());
    let ephemeral = StaticSecret::from(*eph_bytes);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order recipient key".into()));
    }
    let wrapping_key =
        derive_wrapping_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);
    let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: key.as_bytes(),
                aad: context,
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut blob = Vec::with_capacity(WRAPPED_KEY_SIZE);
    blob.push(WRAP_VERSION);
    blob.extend_from_slice(ephemeral_public.as_bytes());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Open a blob produced by [`wrap`] with the recipient's private exchange key.
pub fn unwrap(
    wrapped: &[u8],
    own_secret: &StaticSecret,
    context: &[u8],
) -> Result<MessageKey, CryptoError> {
    if wrapped.len() != WRAPPED_KEY_SIZE {
        return Err(CryptoError::UnwrapFailed(format!(
            "wrapped key must be {WRAPPED_KEY_SIZE} bytes, got {}",
            wrapped.len()
        )));
    }
    if wrapped[0] != WRAP_VERSION {
        return Err(CryptoError::UnwrapFailed(format!(
            "unsupported wrap version {}",
            wrapped[0]
        )));
    }

    let (eph_part, rest) = wrapped[1..].split_at(PUBLIC_KEY_SIZE);
    let (nonce, ciphertext) = rest.split_at(NONCE_SIZE);

    let mut eph_bytes = [0u8; PUBLIC_KEY_SIZE];
    eph_bytes.copy_from_slice(eph_part);
    let ephemeral_public = PublicKey::from(eph_bytes);
    let own_public = PublicKey::from(own_secret);

    let shared = own_secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::UnwrapFailed("low-order ephemeral key".into()));
    }
    let wrapping_key = derive_wrapping_key(shared.as_bytes(), &eph_bytes, own_public.as_bytes())?;

    let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
        .map_err(|e| CryptoError::UnwrapFailed(e.to_string()))?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: context,
                },
            )
            .map_err(|_| CryptoError::UnwrapFailed("authentication failed".into()))?,
    );

    MessageKey::from_slice(&plaintext)
}
