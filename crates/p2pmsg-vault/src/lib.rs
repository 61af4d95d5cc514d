//! # p2pmsg-vault
//!
//! The on-disk, passphrase-protected vault of long-term private keys (§4.B).
//! Generates, seals, and loads the endpoint's Ed25519 identity keypair and
//! X25519 exchange keypair, deriving the vault key from a user passphrase
//! with Argon2id.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod format;
pub mod identity;
pub mod vault;

pub use error::VaultError;
pub use identity::Identity;
pub use vault::KeyVault;
