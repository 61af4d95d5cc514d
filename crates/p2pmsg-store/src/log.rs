//! The encrypted conversation/message log (§3 "Conversation / Message",
//! §4.G).

use std::sync::{Arc, Mutex};

use p2pmsg_core::error::StorageError;
use p2pmsg_crypto::aead::{AeadCipher, AeadKey, NONCE_SIZE};
use p2pmsg_crypto::random::fill_random;
use rusqlite::{params, Connection, OptionalExtension};

use crate::schema::classify;

/// Which side of a conversation a message row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sent by this endpoint.
    Sent,
    /// Received from the peer.
    Received,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(Direction::Sent),
            "received" => Some(Direction::Received),
            _ => None,
        }
    }
}

/// What kind of payload a message row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A plain-text chat message.
    Text,
    /// A file attachment, with metadata carried alongside the ciphertext.
    File,
}

impl MessageKind {
    fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "file" => Some(MessageKind::File),
            _ => None,
        }
    }
}

/// A conversation with a single peer, identified by that peer's fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Row id.
    pub id: i64,
    /// The peer this conversation is with.
    pub peer_fingerprint: [u8; 32],
    /// The peer's locally-assigned display name, if set.
    pub display_name: Option<String>,
    /// Unix timestamp of the most recent message, if any.
    pub last_message_at: Option<u64>,
}

/// A decrypted message row, as returned from history queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    /// Row id.
    pub id: i64,
    /// Sent or received.
    pub direction: Direction,
    /// Text or file.
    pub kind: MessageKind,
    /// The decrypted payload: UTF-8 text for [`MessageKind::Text`], raw bytes
    /// for [`MessageKind::File`].
    pub plaintext: Vec<u8>,
    /// Unix timestamp this message was sent or received.
    pub timestamp: u64,
    /// Original file name, for [`MessageKind::File`] rows.
    pub file_name: Option<String>,
    /// Original file size in bytes, for [`MessageKind::File`] rows.
    pub file_size: Option<u64>,
}

/// The AEAD-sealed message log, keyed by a per-identity log key derived via
/// [`p2pmsg_vault::Identity::derive_log_key`].
///
/// Every row's ciphertext is bound to its own row via AAD (conversation id,
/// direction, timestamp), so a row moved between conversations or relabeled
/// with a different direction fails to decrypt rather than decrypting
/// silently under the wrong context.
pub struct MessageLog {
    conn: Arc<Mutex<Connection>>,
    cipher: AeadCipher,
}

impl MessageLog {
    /// Construct a log over a shared connection and a 32-byte log key.
    #[must_use]
    pub fn new(conn: Arc<Mutex<Connection>>, log_key: [u8; 32]) -> Self {
        let cipher = AeadCipher::new(&AeadKey::new(log_key));
        Self { conn, cipher }
    }

    fn aad(conversation_id: i64, direction: Direction, timestamp: u64) -> Vec<u8> {
        let mut aad = Vec::with_capacity(24);
        aad.extend_from_slice(&conversation_id.to_be_bytes());
        aad.push(direction.as_str().as_bytes()[0]);
        aad.extend_from_slice(&timestamp.to_be_bytes());
        aad
    }

    fn conversation_id_for(conn: &Connection, peer_fingerprint: &[u8; 32], now: u64) -> Result<i64, StorageError> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM conversations WHERE peer_fingerprint = ?1",
                params![peer_fingerprint.as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(classify)?;
        if let Some(id) = existing {
            return Ok(id);
        }
        conn.execute(
            "INSERT INTO conversations (peer_fingerprint, created_at) VALUES (?1, ?2)",
            params![peer_fingerprint.as_slice(), now],
        )
        .map_err(classify)?;
        Ok(conn.last_insert_rowid())
    }

    /// Append a message to the conversation with `peer_fingerprint`,
    /// sealing `plaintext` under the log key. Insertion is idempotent on
    /// `(conversation_id, direction, timestamp, nonce)`: a retried insert
    /// with a fresh nonce is never a duplicate, but a bit-for-bit repeat of
    /// a prior write silently no-ops rather than erroring.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on an AEAD or database failure.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(
        &self,
        peer_fingerprint: &[u8; 32],
        direction: Direction,
        kind: MessageKind,
        plaintext: &[u8],
        timestamp: u64,
        file_name: Option<&str>,
        file_size: Option<u64>,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("message log mutex poisoned");
        let conversation_id = Self::conversation_id_for(&conn, peer_fingerprint, timestamp)?;

        let mut nonce = [0u8; NONCE_SIZE];
        fill_random(&mut nonce).map_err(|e| StorageError::Io(e.to_string()))?;
        let aad = Self::aad(conversation_id, direction, timestamp);
        let ciphertext = self
            .cipher
            .seal(&nonce, &aad, plaintext)
            .map_err(|e| StorageError::Io(e.to_string()))?;

        conn.execute(
            "INSERT OR IGNORE INTO messages
                (conversation_id, direction, kind, ciphertext, nonce, timestamp, file_name, file_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                conversation_id,
                direction.as_str(),
                kind.as_str(),
                ciphertext,
                nonce.as_slice(),
                timestamp,
                file_name,
                file_size.map(|n| n as i64),
            ],
        )
        .map_err(classify)?;

        conn.execute(
            "UPDATE conversations SET last_message_at = ?1 WHERE id = ?2",
            params![timestamp, conversation_id],
        )
        .map_err(classify)?;
        Ok(())
    }

    /// The full message history with `peer_fingerprint`, oldest first,
    /// `limit`-bounded starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CorruptRow`] if a row fails to AEAD-open
    /// (wrong log key or on-disk corruption), or [`StorageError`] on a
    /// database failure.
    pub fn conversation_history(&self, peer_fingerprint: &[u8; 32], limit: u32, offset: u32) -> Result<Vec<MessageRow>, StorageError> {
        let conn = self.conn.lock().expect("message log mutex poisoned");
        let conversation_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM conversations WHERE peer_fingerprint = ?1",
                params![peer_fingerprint.as_slice()],
                |row| row.get(0),
            )
            .optional()
            .map_err(classify)?;
        let Some(conversation_id) = conversation_id else {
            return Ok(Vec::new());
        };

        let mut stmt = conn
            .prepare(
                "SELECT id, direction, kind, ciphertext, nonce, timestamp, file_name, file_size
                 FROM messages WHERE conversation_id = ?1
                 ORDER BY timestamp ASC, id ASC LIMIT ?2 OFFSET ?3",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map(params![conversation_id, limit, offset], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                ))
            })
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;

        rows.into_iter()
            .map(|(id, direction, kind, ciphertext, nonce, timestamp, file_name, file_size)| {
                self.decode_row(conversation_id, id, &direction, &kind, &ciphertext, &nonce, timestamp, file_name, file_size)
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn decode_row(
        &self,
        conversation_id: i64,
        id: i64,
        direction: &str,
        kind: &str,
        ciphertext: &[u8],
        nonce: &[u8],
        timestamp: i64,
        file_name: Option<String>,
        file_size: Option<i64>,
    ) -> Result<MessageRow, StorageError> {
        let direction = Direction::parse(direction).ok_or_else(|| StorageError::CorruptRow(format!("bad direction in row {id}")))?;
        let kind = MessageKind::parse(kind).ok_or_else(|| StorageError::CorruptRow(format!("bad kind in row {id}")))?;
        let nonce: [u8; NONCE_SIZE] = nonce
            .try_into()
            .map_err(|_| StorageError::CorruptRow(format!("bad nonce length in row {id}")))?;
        let timestamp = timestamp as u64;
        let aad = Self::aad(conversation_id, direction, timestamp);
        let plaintext = self
            .cipher
            .open(&nonce, &aad, ciphertext)
            .map_err(|_| StorageError::CorruptRow(format!("failed to open message row {id}")))?;

        Ok(MessageRow {
            id,
            direction,
            kind,
            plaintext,
            timestamp,
            file_name,
            file_size: file_size.map(|n| n as u64),
        })
    }

    /// All conversations, most recently active first (SPEC_FULL.md
    /// supplement: `list_conversations`).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on a database failure.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>, StorageError> {
        let conn = self.conn.lock().expect("message log mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT c.id, c.peer_fingerprint, c.last_message_at, k.display_name
                 FROM conversations c
                 LEFT JOIN contact_keys k ON k.fingerprint = c.peer_fingerprint
                 ORDER BY COALESCE(c.last_message_at, c.created_at) DESC",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map([], |row| {
                let fingerprint: Vec<u8> = row.get(1)?;
                let mut fp = [0u8; 32];
                fp.copy_from_slice(&fingerprint[..32.min(fingerprint.len())]);
                Ok(Conversation {
                    id: row.get(0)?,
                    peer_fingerprint: fp,
                    last_message_at: row.get::<_, Option<i64>>(2)?.map(|n| n as u64),
                    display_name: row.get(3)?,
                })
            })
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::open_connection;
    use tempfile::tempdir;

    fn log() -> (tempfile::TempDir, MessageLog) {
        let dir = tempdir().unwrap();
        let conn = open_connection(&dir.path().join("db.sqlite")).unwrap();
        (dir, MessageLog::new(Arc::new(Mutex::new(conn)), [0x11u8; 32]))
    }

    #[test]
    fn insert_and_read_back_text() {
        let (_dir, log) = log();
        let peer = [0x22u8; 32];
        log.insert_message(&peer, Direction::Sent, MessageKind::Text, b"hello", 1000, None, None).unwrap();
        log.insert_message(&peer, Direction::Received, MessageKind::Text, b"hi back", 1001, None, None).unwrap();

        let history = log.conversation_history(&peer, 10, 0).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].plaintext, b"hello");
        assert_eq!(history[0].direction, Direction::Sent);
        assert_eq!(history[1].plaintext, b"hi back");
        assert_eq!(history[1].direction, Direction::Received);
    }

    #[test]
    fn unknown_peer_has_empty_history() {
        let (_dir, log) = log();
        let history = log.conversation_history(&[0x99u8; 32], 10, 0).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn list_conversations_orders_by_activity() {
        let (_dir, log) = log();
        let a = [0x01u8; 32];
        let b = [0x02u8; 32];
        log.insert_message(&a, Direction::Sent, MessageKind::Text, b"first", 100, None, None).unwrap();
        log.insert_message(&b, Direction::Sent, MessageKind::Text, b"second", 200, None, None).unwrap();

        let conversations = log.list_conversations().unwrap();
        assert_eq!(conversations.len(), 2);
        assert_eq!(conversations[0].peer_fingerprint, b);
        assert_eq!(conversations[1].peer_fingerprint, a);
    }

    #[test]
    fn file_message_carries_metadata() {
        let (_dir, log) = log();
        let peer = [0x33u8; 32];
        log.insert_message(&peer, Direction::Sent, MessageKind::File, b"file bytes", 1500, Some("report.pdf"), Some(10)).unwrap();
        let history = log.conversation_history(&peer, 10, 0).unwrap();
        assert_eq!(history[0].kind, MessageKind::File);
        assert_eq!(history[0].file_name.as_deref(), Some("report.pdf"));
        assert_eq!(history[0].file_size, Some(10));
    }
}
