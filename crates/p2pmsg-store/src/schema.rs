//! Connection setup and table DDL (§4.G): WAL journaling, a 10 s
//! busy-timeout, and the tables backing the peer record and message log.

use std::path::Path;

use p2pmsg_core::error::StorageError;
use rusqlite::Connection;

/// Writers serialize on SQLite's own locking; readers don't block writers as
/// long as the journal mode is WAL, which is why this is set unconditionally
/// rather than left to caller configuration.
const BUSY_TIMEOUT_MS: u32 = 10_000;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS local_keys (
    key_type    TEXT PRIMARY KEY,
    public_key  BLOB NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS contact_keys (
    fingerprint          BLOB PRIMARY KEY,
    identity_public_key  BLOB NOT NULL,
    display_name         TEXT,
    first_seen           INTEGER NOT NULL,
    last_seen            INTEGER NOT NULL,
    verified             INTEGER NOT NULL DEFAULT 0,
    trust_level          INTEGER NOT NULL DEFAULT 0
);

-- The handshake engine's TOFU pin lookup is keyed by an opaque connection
-- context (`listen:<port>` / `dial:<addr>:<port>`), not by fingerprint —
-- the fingerprint is the value under validation (see
-- p2pmsg_core::handshake::PeerPinStore). This index is internal to the
-- store; it is not part of the wire or on-disk formats spec.md itself names.
CREATE TABLE IF NOT EXISTS pin_contexts (
    context              TEXT PRIMARY KEY,
    fingerprint          BLOB NOT NULL,
    identity_public_key  BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id               INTEGER PRIMARY KEY,
    peer_fingerprint BLOB UNIQUE NOT NULL,
    display_name     TEXT,
    created_at       INTEGER NOT NULL,
    last_message_at  INTEGER
);

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id),
    direction       TEXT NOT NULL CHECK (direction IN ('sent', 'received')),
    kind            TEXT NOT NULL CHECK (kind IN ('text', 'file')),
    ciphertext      BLOB NOT NULL,
    nonce           BLOB NOT NULL,
    timestamp       INTEGER NOT NULL,
    file_name       TEXT,
    file_size       INTEGER,
    UNIQUE (conversation_id, direction, timestamp, nonce)
);

CREATE INDEX IF NOT EXISTS messages_by_conversation
    ON messages (conversation_id, timestamp);

-- A historical journal of sessions (§3 'Session'), kept for audit/history
-- only: the live session's keys/counters/replay window are in-memory state
-- owned by the record layer and are never persisted here.
CREATE TABLE IF NOT EXISTS sessions (
    id               INTEGER PRIMARY KEY,
    peer_fingerprint BLOB NOT NULL,
    role             TEXT NOT NULL CHECK (role IN ('initiator', 'responder')),
    started_at       INTEGER NOT NULL,
    ended_at         INTEGER,
    rekeys           INTEGER NOT NULL DEFAULT 0
);
";

/// Open (creating if absent) the database at `path`, enable WAL journaling
/// and the busy-timeout, and apply the schema.
pub fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
    }
    let conn = Connection::open(path).map_err(|e| StorageError::Io(e.to_string()))?;

    conn.busy_timeout(std::time::Duration::from_millis(u64::from(BUSY_TIMEOUT_MS)))
        .map_err(|e| StorageError::Io(e.to_string()))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| StorageError::Io(e.to_string()))?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(|e| StorageError::Io(e.to_string()))?;

    conn.execute_batch(SCHEMA_SQL).map_err(|e| StorageError::Io(e.to_string()))?;
    Ok(conn)
}

/// Translate a [`rusqlite::Error`] into the core storage-error taxonomy,
/// distinguishing a busy database (recoverable — the caller may retry) from
/// any other I/O failure.
pub fn classify(e: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref sqlite_err, _) = e {
        if sqlite_err.code == rusqlite::ErrorCode::DatabaseBusy {
            return StorageError::Busy;
        }
    }
    StorageError::Io(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn opens_and_applies_schema_idempotently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.db");
        open_connection(&path).unwrap();
        // Re-opening an existing database must not fail on `CREATE TABLE`.
        open_connection(&path).unwrap();
    }

    #[test]
    fn journal_mode_is_wal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("messages.db");
        let conn = open_connection(&path).unwrap();
        let mode: String = conn.pragma_query_value(None, "journal_mode", |row| row.get(0)).unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
