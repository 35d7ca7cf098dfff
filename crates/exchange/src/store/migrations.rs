//! Key record schema, tracked in `_exchange_migrations`.

use rusqlite::Connection;

use super::StoreError;

const MIGRATIONS: &[(i32, &str)] = &[(1, MIGRATION_001)];

// Timestamps are unix milliseconds. `expires_at` is provisional while pending
// (created_at + lifetime); activation restarts the lifetime from activated_at.
const MIGRATION_001: &str = "
CREATE TABLE IF NOT EXISTS key_records (
    id           TEXT PRIMARY KEY,
    chat_id      TEXT NOT NULL,
    wrapped_key  BLOB NOT NULL,
    status       TEXT NOT NULL CHECK (status IN ('pending', 'active', 'expired')),
    initiator_id TEXT NOT NULL,
    responder_id TEXT NOT NULL,
    signature    BLOB NOT NULL,
    sender_ack   INTEGER NOT NULL DEFAULT 0 CHECK (sender_ack IN (0, 1)),
    receiver_ack INTEGER NOT NULL DEFAULT 0 CHECK (receiver_ack IN (0, 1)),
    created_at   INTEGER NOT NULL,
    activated_at INTEGER,
    expires_at   INTEGER NOT NULL,
    CHECK (status != 'active' OR (sender_ack = 1 AND receiver_ack = 1)),
    CHECK (initiator_id != responder_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS key_records_one_live_per_chat
    ON key_records (chat_id) WHERE status IN ('pending', 'active');

CREATE INDEX IF NOT EXISTS key_records_chat_created
    ON key_records (chat_id, created_at DESC);

CREATE INDEX IF NOT EXISTS key_records_pending_initiator
    ON key_records (initiator_id) WHERE status = 'pending';

CREATE TRIGGER IF NOT EXISTS key_records_activate
AFTER UPDATE OF sender_ack, receiver_ack ON key_records
WHEN NEW.status = 'pending' AND NEW.sender_ack = 1 AND NEW.receiver_ack = 1
BEGIN
    UPDATE key_records
    SET status       = 'active',
        activated_at = CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER),
        expires_at   = CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)
                       + (NEW.expires_at - NEW.created_at)
    WHERE id = NEW.id;
END;
";

pub(super) fn run_exchange_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _exchange_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _exchange_migrations",
        [],
        |row| row.get(0),
    )?;

    for &(version, sql) in MIGRATIONS {
        if version > current_version {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO _exchange_migrations (version) VALUES (?1)",
                [version],
            )?;
            tx.commit()?;
            tracing::debug!(version, "applied exchange migration");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_exchange_migrations(&conn).unwrap();
        conn
    }

    fn insert(
        conn: &Connection,
        id: &str,
        chat: &str,
        status: &str,
        acks: (i32, i32),
    ) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO key_records (id, chat_id, wrapped_key, status, initiator_id, responder_id,
                                      signature, sender_ack, receiver_ack, created_at, expires_at)
             VALUES (?1, ?2, x'00', ?3, 'a', 'b', x'00', ?4, ?5, 1000, 2000)",
            rusqlite::params![id, chat, status, acks.0, acks.1],
        )
    }

    fn status_of(conn: &Connection, id: &str) -> (String, Option<i64>, i64) {
        conn.query_row(
            "SELECT status, activated_at, expires_at FROM key_records WHERE id = ?1",
            [id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .unwrap()
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = migrated();
        run_exchange_migrations(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM _exchange_migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn second_live_record_for_chat_is_rejected() {
        let conn = migrated();
        insert(&conn, "r1", "c1", "pending", (0, 1)).unwrap();
        assert!(insert(&conn, "r2", "c1", "pending", (0, 1)).is_err());
        // Another chat is unaffected, and expired rows do not occupy the slot.
        insert(&conn, "r3", "c2", "pending", (0, 1)).unwrap();
        insert(&conn, "r4", "c1", "expired", (0, 1)).unwrap();
    }

    #[test]
    fn active_without_both_acks_violates_check() {
        let conn = migrated();
        assert!(insert(&conn, "r1", "c1", "active", (0, 1)).is_err());
        assert!(insert(&conn, "r2", "c2", "active", (1, 0)).is_err());
    }

    #[test]
    fn final_ack_activates_in_same_statement() {
        let conn = migrated();
        insert(&conn, "r1", "c1", "pending", (0, 1)).unwrap();

        conn.execute("UPDATE key_records SET sender_ack = 1 WHERE id = 'r1'", [])
            .unwrap();
        let (status, activated_at, expires_at) = status_of(&conn, "r1");
        assert_eq!(status, "active");
        let activated_at = activated_at.unwrap();
        // Lifetime (1000ms) is restarted from activation.
        assert_eq!(expires_at - activated_at, 1000);
    }

    #[test]
    fn single_ack_leaves_record_pending() {
        let conn = migrated();
        insert(&conn, "r1", "c1", "pending", (0, 0)).unwrap();
        conn.execute("UPDATE key_records SET receiver_ack = 1 WHERE id = 'r1'", [])
            .unwrap();
        let (status, activated_at, _) = status_of(&conn, "r1");
        assert_eq!(status, "pending");
        assert!(activated_at.is_none());
    }

    #[test]
    fn expired_record_is_not_revived_by_ack() {
        let conn = migrated();
        insert(&conn, "r1", "c1", "expired", (0, 1)).unwrap();
        conn.execute("UPDATE key_records SET sender_ack = 1 WHERE id = 'r1'", [])
            .unwrap();
        assert_eq!(status_of(&conn, "r1").0, "expired");
    }
}
