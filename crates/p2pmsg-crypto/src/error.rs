//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid nonce length
    #[error("invalid nonce length")]
    InvalidNonceLength,

    /// Invalid curve point (all-zero or otherwise non-canonical)
    #[error("invalid curve point")]
    InvalidPoint,

    /// Malformed public key bytes (not a valid curve point)
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Malformed signature bytes, or a signature that failed verification
    #[error("invalid signature")]
    InvalidSignature,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Nonce counter exhausted, rekey required
    #[error("nonce counter exhausted, rekey required")]
    NonceOverflow,

    /// Argon2id parameters were out of the accepted range
    #[error("invalid Argon2id parameters: {0}")]
    InvalidKdfParams(String),

    /// Argon2id key derivation failed
    #[error("key derivation failed")]
    KeyDerivationFailed,
}
