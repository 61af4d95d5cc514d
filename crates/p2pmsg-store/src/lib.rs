//! # p2pmsg-store
//!
//! The encrypted conversation/message log and attachment storage (§4.G): a
//! WAL-journaled SQLite database holding pinned peer identities, per-peer
//! conversations, and AEAD-sealed messages, plus a content-addressed
//! attachment directory with path-traversal prevention.
//!
//! Message ciphertext is sealed under a *log key* derived once per vault
//! open (§4.G): `HKDF(identity_private_bytes, salt="log-salt-v1",
//! info="msg-log", 32)`, via [`p2pmsg_vault::Identity::derive_log_key`]. This
//! crate never sees the identity's raw private bytes itself.
//!
//! ## Module structure
//!
//! - [`schema`]: DDL and connection setup (WAL, busy-timeout)
//! - [`pins`]: the [`p2pmsg_core::handshake::PeerPinStore`] implementation and
//!   the peer record (§3 "Peer record")
//! - [`log`]: conversations and messages (§3 "Conversation / Message")
//! - [`attachments`]: sanitized on-disk file attachment storage

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attachments;
pub mod log;
pub mod pins;
pub mod schema;

pub use attachments::AttachmentStore;
pub use log::{Conversation, Direction, MessageKind, MessageLog, MessageRow};
pub use pins::{PeerRecord, SqlitePinStore};

use std::path::Path;
use std::sync::{Arc, Mutex};

use p2pmsg_core::error::StorageError;
use p2pmsg_vault::Identity;

/// Everything the `p2pmsg-store` crate contributes to a running endpoint: the
/// shared database connection behind the message log and pin store, plus the
/// attachment directory. Constructed once per vault `open()`.
pub struct Store {
    /// The peer pin store / peer record table.
    pub pins: SqlitePinStore,
    /// The encrypted conversation/message log.
    pub log: MessageLog,
    /// The sanitized file attachment directory.
    pub attachments: AttachmentStore,
}

impl Store {
    /// Open (creating if absent) the database at `db_path` and the attachment
    /// root at `files_dir`, deriving the log key from `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the database cannot be opened/migrated or
    /// the log key cannot be derived.
    pub fn open(db_path: impl AsRef<Path>, files_dir: impl AsRef<Path>, identity: &Identity) -> Result<Self, StorageError> {
        let conn = schema::open_connection(db_path.as_ref())?;
        let conn = Arc::new(Mutex::new(conn));

        let log_key = identity
            .derive_log_key()
            .map_err(|e| StorageError::Io(format!("log key derivation failed: {e}")))?;

        Ok(Self {
            pins: SqlitePinStore::new(conn.clone()),
            log: MessageLog::new(conn, log_key),
            attachments: AttachmentStore::new(files_dir.as_ref().to_path_buf()),
        })
    }
}
