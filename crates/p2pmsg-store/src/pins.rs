//! The TOFU pin store (§4.D) and the peer record (§3 "Peer record").

use std::sync::{Arc, Mutex};

use p2pmsg_core::error::StorageError;
use p2pmsg_core::handshake::PeerPinStore;
use rusqlite::{params, Connection, OptionalExtension};

use crate::schema::classify;

/// A remembered peer: the identity key a conversation is pinned to, plus the
/// bookkeeping the CLI's `list_peers`/`verify_peer` surface needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// `SHA-256(identity_public_key)`, the value users compare out-of-band.
    pub fingerprint: [u8; 32],
    /// The Ed25519 identity public key pinned for this peer.
    pub identity_public_key: [u8; 32],
    /// A locally-assigned label, if the user has set one.
    pub display_name: Option<String>,
    /// Unix timestamp this peer was first pinned.
    pub first_seen: u64,
    /// Unix timestamp of the most recent session with this peer.
    pub last_seen: u64,
    /// Whether the user has confirmed the fingerprint out-of-band.
    pub verified: bool,
}

/// The [`PeerPinStore`] implementation backing the handshake engine's TOFU
/// check, plus the peer-record queries the CLI needs on top of it.
///
/// `PeerPinStore::lookup`/`pin` are synchronous and keyed by an opaque
/// connection context, not by fingerprint (see
/// [`p2pmsg_core::handshake::PeerPinStore`]); a per-peer [`PeerRecord`] is
/// looked up separately once the fingerprint itself is known.
pub struct SqlitePinStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqlitePinStore {
    /// Wrap a shared connection.
    #[must_use]
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Share this store's underlying connection, e.g. to hand a second
    /// [`SqlitePinStore`] to a [`p2pmsg_core::connection::ConnectionManager`]
    /// while this one stays with [`crate::Store`] for direct queries.
    #[must_use]
    pub fn shared_connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Look up the peer record pinned for `fingerprint`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on a database failure.
    pub fn peer_record(&self, fingerprint: &[u8; 32]) -> Result<Option<PeerRecord>, StorageError> {
        let conn = self.conn.lock().expect("pin store mutex poisoned");
        conn.query_row(
            "SELECT fingerprint, identity_public_key, display_name, first_seen, last_seen, verified
             FROM contact_keys WHERE fingerprint = ?1",
            params![fingerprint.as_slice()],
            row_to_peer_record,
        )
        .optional()
        .map_err(classify)
    }

    /// All pinned peers, most recently seen first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] on a database failure.
    pub fn list_peers(&self) -> Result<Vec<PeerRecord>, StorageError> {
        let conn = self.conn.lock().expect("pin store mutex poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT fingerprint, identity_public_key, display_name, first_seen, last_seen, verified
                 FROM contact_keys ORDER BY last_seen DESC",
            )
            .map_err(classify)?;
        let rows = stmt
            .query_map([], row_to_peer_record)
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;
        Ok(rows)
    }

    /// Mark `fingerprint` as verified out-of-band (§4.D "peer verification").
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if no such peer is pinned, or on a database
    /// failure.
    pub fn set_verified(&self, fingerprint: &[u8; 32], verified: bool) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("pin store mutex poisoned");
        let changed = conn
            .execute(
                "UPDATE contact_keys SET verified = ?1 WHERE fingerprint = ?2",
                params![verified, fingerprint.as_slice()],
            )
            .map_err(classify)?;
        if changed == 0 {
            return Err(StorageError::CorruptRow("no peer record for fingerprint".into()));
        }
        Ok(())
    }

    /// Set the locally-assigned display name for a pinned peer (SPEC_FULL.md
    /// supplement: `set_peer_display_name`).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if no such peer is pinned, or on a database
    /// failure.
    pub fn set_display_name(&self, fingerprint: &[u8; 32], display_name: Option<&str>) -> Result<(), StorageError> {
        let conn = self.conn.lock().expect("pin store mutex poisoned");
        let changed = conn
            .execute(
                "UPDATE contact_keys SET display_name = ?1 WHERE fingerprint = ?2",
                params![display_name, fingerprint.as_slice()],
            )
            .map_err(classify)?;
        if changed == 0 {
            return Err(StorageError::CorruptRow("no peer record for fingerprint".into()));
        }
        Ok(())
    }

    fn touch_peer_record(conn: &Connection, identity_public_key: &[u8; 32], now: u64) -> Result<(), StorageError> {
        let fingerprint = p2pmsg_crypto::hash::Fingerprint::of(identity_public_key);
        conn.execute(
            "INSERT INTO contact_keys (fingerprint, identity_public_key, first_seen, last_seen, verified, trust_level)
             VALUES (?1, ?2, ?3, ?3, 0, 0)
             ON CONFLICT(fingerprint) DO UPDATE SET last_seen = excluded.last_seen",
            params![fingerprint.as_bytes().as_slice(), identity_public_key.as_slice(), now],
        )
        .map_err(classify)?;
        Ok(())
    }
}

fn row_to_peer_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerRecord> {
    let fingerprint: Vec<u8> = row.get(0)?;
    let identity_public_key: Vec<u8> = row.get(1)?;
    Ok(PeerRecord {
        fingerprint: to_array(&fingerprint),
        identity_public_key: to_array(&identity_public_key),
        display_name: row.get(2)?,
        first_seen: row.get::<_, i64>(3)? as u64,
        last_seen: row.get::<_, i64>(4)? as u64,
        verified: row.get::<_, i64>(5)? != 0,
    })
}

fn to_array(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes[..32.min(bytes.len())]);
    out
}

impl PeerPinStore for SqlitePinStore {
    fn lookup(&self, context: &str) -> Option<[u8; 32]> {
        let conn = self.conn.lock().expect("pin store mutex poisoned");
        conn.query_row(
            "SELECT identity_public_key FROM pin_contexts WHERE context = ?1",
            params![context],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .ok()
        .flatten()
        .map(|bytes| to_array(&bytes))
    }

    fn pin(&mut self, context: &str, identity_public_key: [u8; 32]) {
        let now = unix_now();
        let conn = self.conn.lock().expect("pin store mutex poisoned");
        let fingerprint = p2pmsg_crypto::hash::Fingerprint::of(&identity_public_key);
        if let Err(err) = conn.execute(
            "INSERT INTO pin_contexts (context, fingerprint, identity_public_key) VALUES (?1, ?2, ?3)
             ON CONFLICT(context) DO UPDATE SET fingerprint = excluded.fingerprint, identity_public_key = excluded.identity_public_key",
            params![context, fingerprint.as_bytes().as_slice(), identity_public_key.as_slice()],
        ) {
            tracing::error!(%err, "failed to persist pin");
            return;
        }
        if let Err(err) = Self::touch_peer_record(&conn, &identity_public_key, now) {
            tracing::error!(%err, "failed to update peer record");
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::open_connection;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SqlitePinStore) {
        let dir = tempdir().unwrap();
        let conn = open_connection(&dir.path().join("db.sqlite")).unwrap();
        (dir, SqlitePinStore::new(Arc::new(Mutex::new(conn))))
    }

    #[test]
    fn pin_then_lookup_round_trips() {
        let (_dir, mut store) = store();
        let key = [0x42u8; 32];
        assert!(store.lookup("dial:1.2.3.4:9000").is_none());
        store.pin("dial:1.2.3.4:9000", key);
        assert_eq!(store.lookup("dial:1.2.3.4:9000"), Some(key));
    }

    #[test]
    fn pinning_creates_a_peer_record() {
        let (_dir, mut store) = store();
        let key = [0x7au8; 32];
        store.pin("listen:9000", key);
        let fp = p2pmsg_crypto::hash::Fingerprint::of(&key);
        let record = store.peer_record(fp.as_bytes()).unwrap().expect("record created");
        assert_eq!(record.identity_public_key, key);
        assert!(!record.verified);
    }

    #[test]
    fn set_verified_and_display_name() {
        let (_dir, mut store) = store();
        let key = [0x11u8; 32];
        store.pin("listen:9001", key);
        let fp = p2pmsg_crypto::hash::Fingerprint::of(&key);
        store.set_verified(fp.as_bytes(), true).unwrap();
        store.set_display_name(fp.as_bytes(), Some("Alice")).unwrap();
        let record = store.peer_record(fp.as_bytes()).unwrap().unwrap();
        assert!(record.verified);
        assert_eq!(record.display_name.as_deref(), Some("Alice"));
    }

    #[test]
    fn set_verified_on_unknown_peer_fails() {
        let (_dir, store) = store();
        let err = store.set_verified(&[0u8; 32], true).unwrap_err();
        assert!(matches!(err, StorageError::CorruptRow(_)));
    }
}
