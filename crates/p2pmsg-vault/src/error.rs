//! Vault error taxonomy (§7 `VaultError`).

use thiserror::Error;

/// Errors arising from vault initialization, opening, or rotation.
#[derive(Debug, Error)]
pub enum VaultError {
    /// `initialize` was called against a directory that already has key files.
    #[error("vault already exists at {0}")]
    Exists(std::path::PathBuf),

    /// `open`/`rotate_passphrase` was called against a directory with no key files.
    #[error("no vault found at {0}")]
    NotFound(std::path::PathBuf),

    /// Every candidate vault key derived from the stored salts failed to
    /// authenticate the sealed private key.
    #[error("incorrect passphrase")]
    BadPassphrase,

    /// The on-disk key file is structurally invalid: bad magic, unknown
    /// version, truncated, unknown key type, or a sealed record that fails
    /// authentication under a *correctly*-derived key (which can only mean
    /// tampering or truncation, not a wrong passphrase).
    #[error("corrupt vault file: {0}")]
    Corrupt(String),

    /// Underlying filesystem I/O failure.
    #[error("vault I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cryptographic operation failed in a way not attributable to the
    /// passphrase (e.g. the CSPRNG was unavailable).
    #[error("vault crypto error: {0}")]
    Crypto(#[from] p2pmsg_crypto::CryptoError),
}
