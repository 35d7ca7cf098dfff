//! Durable key record storage.
//!
//! The store enforces the lifecycle rules itself so that no sequence of
//! client calls can break them:
//! - a chat has at most one record in `pending` or `active`;
//! - a record becomes `active` in the same statement that sets its last ack;
//! - `active` with an ack missing is rejected.

mod migrations;
mod sqlite;

pub use sqlite::SqliteRecordStore;

use std::time::Duration;

use async_trait::async_trait;
use chatkey_shared::api::key_record::KeyRecord;
use chatkey_shared::ids::{ChatId, KeyRecordId, UserId};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The chat's live slot is taken, or the record to supersede moved on.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("key record {0} not found")]
    NotFound(KeyRecordId),

    /// The record is no longer pending, or the caller is not its initiator.
    #[error("key record {0} is not pending for this user")]
    NotPending(KeyRecordId),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Backend(format!("store worker failed: {err}"))
    }
}

/// Fields the responder supplies when creating a record.
#[derive(Debug, Clone)]
pub struct NewKeyRecord {
    pub id: KeyRecordId,
    pub chat_id: ChatId,
    pub wrapped_key: Vec<u8>,
    pub initiator_id: UserId,
    pub responder_id: UserId,
    pub signature: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// Key lifetime; `expires_at` is counted from activation.
    pub lifetime: Duration,
}

#[async_trait]
pub trait KeyRecordStore: Send + Sync {
    /// Insert a pending record with `receiver_ack` set.
    ///
    /// In the same transaction, pending records of the chat older than
    /// `pending_max_age` are expired and, when `supersede` is given, that
    /// pending or active record is expired. A `supersede` record that an
    /// expiry pass already retired counts as done. Fails with
    /// [`StoreError::Conflict`] when the chat still has a live record or
    /// `supersede` names a record that is neither live nor expired.
    async fn insert_pending(
        &self,
        record: NewKeyRecord,
        supersede: Option<KeyRecordId>,
        pending_max_age: Duration,
    ) -> Result<KeyRecord, StoreError>;

    async fn get(&self, id: KeyRecordId) -> Result<Option<KeyRecord>, StoreError>;

    /// The chat's pending or active record, if any.
    async fn live_record(&self, chat_id: ChatId) -> Result<Option<KeyRecord>, StoreError>;

    /// The chat's most recently created record in any state.
    async fn latest_record(&self, chat_id: ChatId) -> Result<Option<KeyRecord>, StoreError>;

    /// Set `sender_ack` on a pending record whose initiator is `initiator`
    /// and return the record as it stands afterwards. Acknowledging an
    /// already active record again is a no-op that returns it.
    async fn acknowledge(
        &self,
        id: KeyRecordId,
        initiator: UserId,
    ) -> Result<KeyRecord, StoreError>;

    /// Pending records waiting on `user`'s acknowledgment, oldest first.
    async fn pending_for(&self, user: UserId) -> Result<Vec<KeyRecord>, StoreError>;

    /// Expire live records past `expires_at` and pending records older than
    /// `pending_max_age`. Returns the records that changed.
    async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        pending_max_age: Duration,
    ) -> Result<Vec<KeyRecord>, StoreError>;
}
