//! # p2pmsg-crypto
//!
//! Typed façade over the primitives the secure channel is built from:
//! X25519 key agreement, Ed25519 signatures, ChaCha20-Poly1305 AEAD,
//! HKDF-SHA256, Argon2id, SHA-256 fingerprinting, and the OS CSPRNG.
//!
//! This crate carries no protocol state of its own — it is the leaf
//! dependency for `p2pmsg-vault` and `p2pmsg-core`.
//!
//! ## Module structure
//!
//! - [`x25519`]: Diffie-Hellman key exchange
//! - [`signatures`]: Ed25519 signing and verification
//! - [`aead`]: ChaCha20-Poly1305 seal/open
//! - [`kdf`]: HKDF-SHA256 and Argon2id
//! - [`hash`]: SHA-256 identity fingerprints
//! - [`random`]: CSPRNG helpers
//! - [`constant_time`]: timing-safe comparisons and selection

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod constant_time;
pub mod error;
pub mod hash;
pub mod kdf;
pub mod random;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;
