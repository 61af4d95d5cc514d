//! Sanitized on-disk storage for file attachments (§3 "File transfer").
//!
//! Ciphertext for file payloads lives in the message log alongside text
//! messages; this module is for the plaintext bytes once a transfer
//! completes, laid out as `<root>/<peer_fingerprint_hex>/<sanitized_name>`.
//! Every path is checked to resolve inside `root` before any I/O, closing
//! off `../`-style traversal from a peer-supplied file name.

use std::path::{Path, PathBuf};

use p2pmsg_core::error::StorageError;

/// The attachment directory root, namespaced per peer.
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    /// Use `root` as the attachment directory, creating it lazily on first
    /// write.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Strip any path separators and leading dots from `name`, so the result
    /// is always a single path component.
    fn sanitize_name(name: &str) -> String {
        let cleaned: String = name
            .chars()
            .filter(|c| !matches!(c, '/' | '\\' | '\0'))
            .collect();
        let cleaned = cleaned.trim_start_matches('.');
        if cleaned.is_empty() {
            "unnamed".to_string()
        } else {
            cleaned.to_string()
        }
    }

    fn peer_dir(&self, peer_fingerprint: &[u8; 32]) -> PathBuf {
        self.root.join(hex::encode(peer_fingerprint))
    }

    /// The path a file for `peer_fingerprint` named `name` would be stored
    /// at, without touching the filesystem.
    #[must_use]
    pub fn resolve(&self, peer_fingerprint: &[u8; 32], name: &str) -> PathBuf {
        self.peer_dir(peer_fingerprint).join(Self::sanitize_name(name))
    }

    /// Write `bytes` to the attachment path for `peer_fingerprint`/`name`,
    /// creating the peer's directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the resolved path would escape `root`, or
    /// on an I/O failure.
    pub fn save(&self, peer_fingerprint: &[u8; 32], name: &str, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        let dir = self.peer_dir(peer_fingerprint);
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::Io(e.to_string()))?;
        let path = dir.join(Self::sanitize_name(name));
        Self::verify_contained(&self.root, &path)?;
        std::fs::write(&path, bytes).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(path)
    }

    /// Read back a previously saved attachment.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the resolved path would escape `root`, or
    /// on an I/O failure (including the file not existing).
    pub fn load(&self, peer_fingerprint: &[u8; 32], name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(peer_fingerprint, name);
        Self::verify_contained(&self.root, &path)?;
        std::fs::read(&path).map_err(|e| StorageError::Io(e.to_string()))
    }

    /// Reject any resolved path that does not lexically stay within `root`.
    ///
    /// This runs before the sanitized name is joined onto the filesystem, as
    /// a defense-in-depth check independent of [`Self::sanitize_name`]: a
    /// future change to sanitization that reintroduces `..` segments still
    /// gets caught here.
    fn verify_contained(root: &Path, candidate: &Path) -> Result<(), StorageError> {
        if candidate.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(StorageError::Io("attachment path escapes storage root".into()));
        }
        if !candidate.starts_with(root) {
            return Err(StorageError::Io("attachment path escapes storage root".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = AttachmentStore::new(dir.path().to_path_buf());
        let peer = [0x44u8; 32];
        store.save(&peer, "report.pdf", b"pdf bytes").unwrap();
        let bytes = store.load(&peer, "report.pdf").unwrap();
        assert_eq!(bytes, b"pdf bytes");
    }

    #[test]
    fn traversal_attempt_is_sanitized_into_root() {
        let dir = tempdir().unwrap();
        let store = AttachmentStore::new(dir.path().to_path_buf());
        let peer = [0x55u8; 32];
        let path = store.resolve(&peer, "../../etc/passwd");
        assert!(path.starts_with(dir.path()));
        assert!(!path.to_string_lossy().contains(".."));
    }

    #[test]
    fn separate_peers_get_separate_directories() {
        let dir = tempdir().unwrap();
        let store = AttachmentStore::new(dir.path().to_path_buf());
        let a = [0x01u8; 32];
        let b = [0x02u8; 32];
        store.save(&a, "same-name.txt", b"a's file").unwrap();
        store.save(&b, "same-name.txt", b"b's file").unwrap();
        assert_eq!(store.load(&a, "same-name.txt").unwrap(), b"a's file");
        assert_eq!(store.load(&b, "same-name.txt").unwrap(), b"b's file");
    }
}
