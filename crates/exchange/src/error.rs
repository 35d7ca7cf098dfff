use chatkey_crypto::error::CryptoError;
use chatkey_shared::ids::{ChatId, KeyRecordId, UserId};
use thiserror::Error;

use crate::relay::TransportError;
use crate::store::StoreError;

/// Errors surfaced by the key exchange service.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// A wrap, unwrap, signature or key-store primitive failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(StoreError),

    /// Another party won the race for the chat's live slot.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Both the relay and the durable-store fallback failed to deliver.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(#[from] TransportError),

    /// No active key yet; an exchange is under way.
    #[error("key pending for chat {0}")]
    KeyPending(ChatId),

    #[error("chat {0} is not open")]
    ChatNotOpen(ChatId),

    #[error("user {0} cannot be a peer in this chat")]
    InvalidPeer(UserId),

    #[error("user {user} is not a participant of record {record}")]
    NotParticipant { user: UserId, record: KeyRecordId },

    #[error("record {0} has expired")]
    RecordExpired(KeyRecordId),

    #[error("directory error: {0}")]
    Directory(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A background worker panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

impl From<StoreError> for ExchangeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ExchangeError::StateConflict(msg),
            other => ExchangeError::Store(other),
        }
    }
}

impl From<tokio::task::JoinError> for ExchangeError {
    fn from(err: tokio::task::JoinError) -> Self {
        ExchangeError::Task(err.to_string())
    }
}

impl From<ExchangeError> for chatkey_shared::error::ChatKeyError {
    fn from(err: ExchangeError) -> Self {
        use chatkey_shared::error::ChatKeyError;
        match err {
            ExchangeError::Crypto(e) => e.into(),
            ExchangeError::Store(StoreError::NotFound(_)) => ChatKeyError::NotFound,
            ExchangeError::TransportUnavailable(_) => ChatKeyError::Unreachable,
            ExchangeError::Config(msg) => ChatKeyError::Validation(msg),
            other => ChatKeyError::Internal(other.to_string()),
        }
    }
}
