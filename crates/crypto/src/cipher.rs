//! Authenticated message encryption with AES-256-GCM.
//!
//! Nonces are drawn from the OS CSPRNG inside [`encrypt`]; no function in
//! this module accepts a caller-chosen nonce for sealing, so a nonce cannot be
//! reused under the same key by construction.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use chatkey_shared::api::base64_serde;
use chatkey_shared::ids::{ChatId, KeyRecordId};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CryptoError, DecryptError};
use crate::key::MessageKey;

pub const NONCE_SIZE: usize = 12; // 96-bit nonce for AES-256-GCM
pub const TAG_SIZE: usize = 16;

const MESSAGE_AAD_LABEL: &[u8] = b"chatkey-message-v1";

/// Output of [`encrypt`]: `ciphertext` carries the 16-byte auth tag at its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Encrypt `plaintext` under `key`, binding `aad` into the tag.
pub fn encrypt(plaintext: &[u8], key: &MessageKey, aad: &[u8]) -> Result<Sealed, CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(Sealed { nonce, ciphertext })
}

/// Decrypt and authenticate. Any tag mismatch is reported as
/// [`DecryptError::AuthenticationFailed`]; no partial plaintext is returned.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &[u8],
    key: &MessageKey,
    aad: &[u8],
) -> Result<Vec<u8>, DecryptError> {
    if nonce.len() != NONCE_SIZE {
        return Err(DecryptError::Malformed(format!(
            "nonce must be {NONCE_SIZE} bytes, got {}",
            nonce.len()
        )));
    }
    if ciphertext.len() < TAG_SIZE {
        return Err(DecryptError::Malformed(
            "ciphertext shorter than auth tag".into(),
        ));
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| DecryptError::Malformed(e.to_string()))?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| DecryptError::AuthenticationFailed)
}

/// Associated data for chat messages: ties a ciphertext to one conversation.
pub fn message_aad(chat_id: &ChatId) -> Vec<u8> {
    let mut aad = Vec::with_capacity(MESSAGE_AAD_LABEL.len() + 16);
    aad.extend_from_slice(MESSAGE_AAD_LABEL);
    aad.extend_from_slice(chat_id.as_bytes());
    aad
}

/// A chat message as stored and transmitted.
///
/// `key_id` names the key record the sender encrypted under. It is a lookup
/// hint for the receiver's key cache and is not trusted for anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMessage {
    pub key_id: KeyRecordId,
    #[serde(with = "base64_serde")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_serde")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedMessage {
    pub fn seal(
        chat_id: &ChatId,
        key_id: KeyRecordId,
        key: &MessageKey,
        plaintext: &[u8],
    ) -> Result<Self, CryptoError> {
        let sealed = encrypt(plaintext, key, &message_aad(chat_id))?;
        Ok(Self {
            key_id,
            nonce: sealed.nonce.to_vec(),
            ciphertext: sealed.ciphertext,
        })
    }

    pub fn open(&self, chat_id: &ChatId, key: &MessageKey) -> Result<Vec<u8>, DecryptError> {
        decrypt(&self.ciphertext, &self.nonce, key, &message_aad(chat_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_recovers_plaintext() {
        let key = MessageKey::generate();
        let sealed = encrypt(b"the quick brown fox", &key, b"ctx").unwrap();
        let plaintext = decrypt(&sealed.ciphertext, &sealed.nonce, &key, b"ctx").unwrap();
        assert_eq!(plaintext, b"the quick brown fox");
    }

    #[test]
    fn round_trip_holds_for_assorted_sizes() {
        let key = MessageKey::generate();
        for len in [0usize, 1, 15, 16, 17, 255, 4096, 100_000] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let sealed = encrypt(&data, &key, &[]).unwrap();
            assert_eq!(
                decrypt(&sealed.ciphertext, &sealed.nonce, &key, &[]).unwrap(),
                data
            );
        }
    }

    #[test]
    fn ciphertext_carries_tag() {
        let key = MessageKey::generate();
        let sealed = encrypt(b"hello", &key, &[]).unwrap();
        assert_eq!(sealed.ciphertext.len(), 5 + TAG_SIZE);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let key = MessageKey::generate();
        let other = MessageKey::generate();
        let sealed = encrypt(b"secret", &key, &[]).unwrap();
        let result = decrypt(&sealed.ciphertext, &sealed.nonce, &other, &[]);
        assert_eq!(result, Err(DecryptError::AuthenticationFailed));
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let key = MessageKey::generate();
        let mut sealed = encrypt(b"secret payload", &key, &[]).unwrap();
        sealed.ciphertext[3] ^= 0x01;
        let result = decrypt(&sealed.ciphertext, &sealed.nonce, &key, &[]);
        assert_eq!(result, Err(DecryptError::AuthenticationFailed));
    }

    #[test]
    fn aad_mismatch_fails_authentication() {
        let key = MessageKey::generate();
        let sealed = encrypt(b"payload", &key, b"chat-a").unwrap();
        let result = decrypt(&sealed.ciphertext, &sealed.nonce, &key, b"chat-b");
        assert_eq!(result, Err(DecryptError::AuthenticationFailed));
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let key = MessageKey::generate();
        let a = encrypt(b"same", &key, &[]).unwrap();
        let b = encrypt(b"same", &key, &[]).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn short_inputs_are_malformed() {
        let key = MessageKey::generate();
        assert!(matches!(
            decrypt(&[0u8; 32], &[0u8; 5], &key, &[]),
            Err(DecryptError::Malformed(_))
        ));
        assert!(matches!(
            decrypt(&[0u8; 4], &[0u8; NONCE_SIZE], &key, &[]),
            Err(DecryptError::Malformed(_))
        ));
    }

    #[test]
    fn message_is_bound_to_its_chat() {
        let key = MessageKey::generate();
        let chat = ChatId::new();
        let msg = EncryptedMessage::seal(&chat, KeyRecordId::new(), &key, b"hi").unwrap();
        assert_eq!(msg.open(&chat, &key).unwrap(), b"hi");
        assert_eq!(
            msg.open(&ChatId::new(), &key),
            Err(DecryptError::AuthenticationFailed)
        );
    }

    #[test]
    fn encrypted_message_json_round_trip() {
        let key = MessageKey::generate();
        let chat = ChatId::new();
        let msg = EncryptedMessage::seal(&chat, KeyRecordId::new(), &key, b"json").unwrap();
        let json = serde_json::to_string(&msg).unwrap();
        let back: EncryptedMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.open(&chat, &key).unwrap(), b"json");
    }
}
