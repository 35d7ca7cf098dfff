//! User-visible rendering states for received messages.

use serde::{Deserialize, Serialize};

/// How the UI should present a received message.
///
/// Keeps an authentication failure visibly different from a key that is
/// still being exchanged and from a relay hiccup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageDisplay {
    Plaintext { text: String },
    /// Decryption ran and failed; the message will never render.
    Undecryptable { reason: String },
    /// No active key yet; the message may render once the exchange completes.
    KeyPending,
    /// Delivery is retrying over the durable-store fallback.
    TransportDelayed,
}

impl MessageDisplay {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            MessageDisplay::Plaintext { .. } | MessageDisplay::Undecryptable { .. }
        )
    }
}
