//! Key-exchange signals carried by the low-latency relay.
//!
//! Signals only ever reference records by id. Key material travels inside
//! `KeyRecord::wrapped_key` in the durable store, never over the relay.

use serde::{Deserialize, Serialize};

use crate::ids::{ChatId, KeyRecordId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Signal {
    /// A pending record addressed to the recipient is waiting in the store.
    KeyNotify {
        chat_id: ChatId,
        record_id: KeyRecordId,
    },
    /// The recipient unwrapped and acknowledged the record.
    Ack {
        chat_id: ChatId,
        record_id: KeyRecordId,
    },
    /// Ask the peer to run its rotation check for the chat.
    RotateRequest { chat_id: ChatId },
}

impl Signal {
    pub fn chat_id(&self) -> ChatId {
        match self {
            Signal::KeyNotify { chat_id, .. }
            | Signal::Ack { chat_id, .. }
            | Signal::RotateRequest { chat_id } => *chat_id,
        }
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::KeyNotify { .. } => "key_notify",
            Signal::Ack { .. } => "ack",
            Signal::RotateRequest { .. } => "rotate_request",
        }
    }
}
