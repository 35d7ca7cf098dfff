//! Ed25519 signatures over key records.
//!
//! The responder signs the fields that decide who a key belongs to and what it
//! is. The initiator verifies before unwrapping, so neither the durable store
//! nor the relay can substitute a key of its own.

use chatkey_shared::api::key_record::KeyRecord;
use chatkey_shared::ids::{ChatId, KeyRecordId, UserId};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::CryptoError;

const RECORD_LABEL: &[u8] = b"chatkey-record-sig-v1";

/// The signed portion of a key record.
#[derive(Debug, Clone, Copy)]
pub struct RecordFields<'a> {
    pub record_id: &'a KeyRecordId,
    pub chat_id: &'a ChatId,
    pub initiator_id: &'a UserId,
    pub responder_id: &'a UserId,
    pub wrapped_key: &'a [u8],
}

impl<'a> From<&'a KeyRecord> for RecordFields<'a> {
    fn from(record: &'a KeyRecord) -> Self {
        Self {
            record_id: &record.id,
            chat_id: &record.chat_id,
            initiator_id: &record.initiator_id,
            responder_id: &record.responder_id,
            wrapped_key: &record.wrapped_key,
        }
    }
}

impl RecordFields<'_> {
    fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_LABEL.len() + 64 + 4 + self.wrapped_key.len());
        out.extend_from_slice(RECORD_LABEL);
        out.extend_from_slice(self.record_id.as_bytes());
        out.extend_from_slice(self.chat_id.as_bytes());
        out.extend_from_slice(self.initiator_id.as_bytes());
        out.extend_from_slice(self.responder_id.as_bytes());
        out.extend_from_slice(&(self.wrapped_key.len() as u32).to_be_bytes());
        out.extend_from_slice(self.wrapped_key);
        out
    }
}

pub fn sign_record(signing_key: &SigningKey, fields: RecordFields<'_>) -> Vec<u8> {
    signing_key.sign(&fields.canonical_bytes()).to_bytes().to_vec()
}

/// Verify a record signature. Any failure, including a malformed signature,
/// is [`CryptoError::InvalidSignature`].
pub fn verify_record(
    verifying_key: &VerifyingKey,
    fields: RecordFields<'_>,
    signature: &[u8],
) -> Result<(), CryptoError> {
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    verifying_key
        .verify(&fields.canonical_bytes(), &signature)
        .map_err(|_| CryptoError::InvalidSignature)
}
