use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::base64_serde;
use crate::ids::{ChatId, KeyRecordId, UserId};

/// Lifecycle status of a single key record.
///
/// `Expired` is terminal. A chat holds at most one record that is `Pending`
/// or `Active` at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Pending,
    Active,
    Expired,
}

impl KeyStatus {
    /// Column value used by the durable store.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Pending => "pending",
            KeyStatus::Active => "active",
            KeyStatus::Expired => "expired",
        }
    }

    /// Parse a stored column value. Matching is case-sensitive.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(KeyStatus::Pending),
            "active" => Some(KeyStatus::Active),
            "expired" => Some(KeyStatus::Expired),
            _ => None,
        }
    }

    /// Whether the record occupies the chat's single live slot.
    pub fn is_live(&self) -> bool {
        matches!(self, KeyStatus::Pending | KeyStatus::Active)
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record describing the exchange state of one chat key.
///
/// The responder creates the record and wraps the fresh key for the
/// initiator's public key, so `receiver_ack` starts out true and only the
/// initiator's `sender_ack` is outstanding while the record is pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: KeyRecordId,
    pub chat_id: ChatId,
    #[serde(with = "base64_serde")]
    pub wrapped_key: Vec<u8>,
    pub status: KeyStatus,
    pub initiator_id: UserId,
    pub responder_id: UserId,
    #[serde(with = "base64_serde")]
    pub signature: Vec<u8>,
    pub sender_ack: bool,
    pub receiver_ack: bool,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl KeyRecord {
    /// The other participant from `user`'s point of view, if `user` is one.
    pub fn peer_of(&self, user: UserId) -> Option<UserId> {
        if user == self.initiator_id {
            Some(self.responder_id)
        } else if user == self.responder_id {
            Some(self.initiator_id)
        } else {
            None
        }
    }
}

/// Key state summary for UI display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStatusView {
    /// `None` when the chat has never had a key record.
    pub status: Option<KeyStatus>,
    pub record_id: Option<KeyRecordId>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl KeyStatusView {
    pub fn none() -> Self {
        Self {
            status: None,
            record_id: None,
            activated_at: None,
            expires_at: None,
        }
    }
}

impl From<&KeyRecord> for KeyStatusView {
    fn from(record: &KeyRecord) -> Self {
        Self {
            status: Some(record.status),
            record_id: Some(record.id),
            activated_at: record.activated_at,
            expires_at: Some(record.expires_at),
        }
    }
}
