use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatkey_shared::api::key_record::{KeyRecord, KeyStatus};
use chatkey_shared::ids::{ChatId, KeyRecordId, UserId};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior};

use super::migrations::run_exchange_migrations;
use super::{KeyRecordStore, NewKeyRecord, StoreError};

const RECORD_COLUMNS: &str = "id, chat_id, wrapped_key, status, initiator_id, responder_id, \
     signature, sender_ack, receiver_ack, created_at, activated_at, expires_at";

// SQLITE_CONSTRAINT_UNIQUE and SQLITE_CONSTRAINT_PRIMARYKEY.
const UNIQUE_VIOLATION_CODES: [i32; 2] = [2067, 1555];

/// SQLite-backed record store. Statements run on blocking workers; the
/// connection lock is held for one statement or transaction at a time.
#[derive(Clone)]
pub struct SqliteRecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout=5000;",
        )?;
        run_exchange_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("record store lock poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn parse_id<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: T::Err| conversion_error(idx, format!("invalid id {raw}: {e}")))
}

fn parse_ts(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| conversion_error(idx, format!("timestamp out of range: {millis}")))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<KeyRecord> {
    let status: String = row.get(3)?;
    let activated_at: Option<i64> = row.get(10)?;
    Ok(KeyRecord {
        id: parse_id(row, 0)?,
        chat_id: parse_id(row, 1)?,
        wrapped_key: row.get(2)?,
        status: KeyStatus::parse(&status)
            .ok_or_else(|| conversion_error(3, format!("unknown status {status}")))?,
        initiator_id: parse_id(row, 4)?,
        responder_id: parse_id(row, 5)?,
        signature: row.get(6)?,
        sender_ack: row.get(7)?,
        receiver_ack: row.get(8)?,
        created_at: parse_ts(9, row.get(9)?)?,
        activated_at: activated_at.map(|ms| parse_ts(10, ms)).transpose()?,
        expires_at: parse_ts(11, row.get(11)?)?,
    })
}

fn select_one(
    conn: &Connection,
    clause: &str,
    param: String,
) -> Result<Option<KeyRecord>, StoreError> {
    let sql = format!("SELECT {RECORD_COLUMNS} FROM key_records WHERE {clause}");
    let record = conn.query_row(&sql, [param], record_from_row).optional()?;
    Ok(record)
}

fn is_expired_in_chat(conn: &Connection, id: &KeyRecordId, chat: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM key_records
                       WHERE id = ?1 AND chat_id = ?2 AND status = 'expired')",
        rusqlite::params![id.to_string(), chat],
        |row| row.get(0),
    )
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if UNIQUE_VIOLATION_CODES.contains(&e.extended_code)
    )
}

#[async_trait]
impl KeyRecordStore for SqliteRecordStore {
    async fn insert_pending(
        &self,
        record: NewKeyRecord,
        supersede: Option<KeyRecordId>,
        pending_max_age: Duration,
    ) -> Result<KeyRecord, StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let chat = record.chat_id.to_string();
            let created_at = to_millis(record.created_at);

            let abandoned = tx.execute(
                "UPDATE key_records SET status = 'expired'
                 WHERE chat_id = ?1 AND status = 'pending' AND created_at < ?2",
                rusqlite::params![chat, created_at - duration_millis(pending_max_age)],
            )?;
            if abandoned > 0 {
                tracing::info!(chat_id = %record.chat_id, "expired abandoned pending record");
            }

            if let Some(old) = supersede {
                let changed = tx.execute(
                    "UPDATE key_records SET status = 'expired'
                     WHERE id = ?1 AND chat_id = ?2 AND status IN ('pending', 'active')",
                    rusqlite::params![old.to_string(), chat],
                )?;
                // Already swept by an expiry pass: the slot is free unless
                // another record took it, which the unique index catches.
                if changed == 0 && !is_expired_in_chat(&tx, &old, &chat)? {
                    return Err(StoreError::Conflict(format!(
                        "record {old} is no longer the live record"
                    )));
                }
            }

            let inserted = tx.execute(
                "INSERT INTO key_records (id, chat_id, wrapped_key, status, initiator_id,
                     responder_id, signature, sender_ack, receiver_ack, created_at, expires_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, 0, 1, ?7, ?8)",
                rusqlite::params![
                    record.id.to_string(),
                    chat,
                    record.wrapped_key,
                    record.initiator_id.to_string(),
                    record.responder_id.to_string(),
                    record.signature,
                    created_at,
                    created_at.saturating_add(duration_millis(record.lifetime)),
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(StoreError::Conflict(format!(
                        "chat {} already has a live record",
                        record.chat_id
                    )));
                }
                Err(e) => return Err(e.into()),
            }

            let stored = select_one(&tx, "id = ?1", record.id.to_string())?
                .ok_or(StoreError::NotFound(record.id))?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn get(&self, id: KeyRecordId) -> Result<Option<KeyRecord>, StoreError> {
        self.run(move |conn| select_one(conn, "id = ?1", id.to_string()))
            .await
    }

    async fn live_record(&self, chat_id: ChatId) -> Result<Option<KeyRecord>, StoreError> {
        self.run(move |conn| {
            select_one(
                conn,
                "chat_id = ?1 AND status IN ('pending', 'active')",
                chat_id.to_string(),
            )
        })
        .await
    }

    async fn latest_record(&self, chat_id: ChatId) -> Result<Option<KeyRecord>, StoreError> {
        self.run(move |conn| {
            select_one(
                conn,
                "chat_id = ?1 ORDER BY created_at DESC, id DESC LIMIT 1",
                chat_id.to_string(),
            )
        })
        .await
    }

    async fn acknowledge(
        &self,
        id: KeyRecordId,
        initiator: UserId,
    ) -> Result<KeyRecord, StoreError> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE key_records SET sender_ack = 1
                 WHERE id = ?1 AND initiator_id = ?2 AND status = 'pending'",
                rusqlite::params![id.to_string(), initiator.to_string()],
            )?;

            let record =
                select_one(conn, "id = ?1", id.to_string())?.ok_or(StoreError::NotFound(id))?;
            if changed == 1 {
                return Ok(record);
            }
            // Repeat ack of a record this initiator already activated.
            if record.initiator_id == initiator
                && record.status == KeyStatus::Active
                && record.sender_ack
            {
                return Ok(record);
            }
            Err(StoreError::NotPending(id))
        })
        .await
    }

    async fn pending_for(&self, user: UserId) -> Result<Vec<KeyRecord>, StoreError> {
        self.run(move |conn| {
            let sql = format!(
                "SELECT {RECORD_COLUMNS} FROM key_records
                 WHERE initiator_id = ?1 AND status = 'pending' AND sender_ack = 0
                 ORDER BY created_at ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let records = stmt
                .query_map([user.to_string()], record_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    async fn expire_overdue(
        &self,
        now: DateTime<Utc>,
        pending_max_age: Duration,
    ) -> Result<Vec<KeyRecord>, StoreError> {
        self.run(move |conn| {
            let now_ms = to_millis(now);
            let sql = format!(
                "UPDATE key_records SET status = 'expired'
                 WHERE (status IN ('pending', 'active') AND expires_at <= ?1)
                    OR (status = 'pending' AND created_at < ?2)
                 RETURNING {RECORD_COLUMNS}"
            );
            let tx = conn.transaction()?;
            let expired = {
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(
                    rusqlite::params![now_ms, now_ms - duration_millis(pending_max_age)],
                    record_from_row,
                )?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            tx.commit()?;
            if !expired.is_empty() {
                tracing::info!(count = expired.len(), "expired overdue key records");
            }
            Ok(expired)
        })
        .await
    }
}
