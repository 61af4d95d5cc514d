//! Key derivation: HKDF-SHA256 for session/rekey/log keys, Argon2id for the
//! vault's passphrase-derived key.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::CryptoError;

/// Argon2id parameters, fixed per §4.B's storage layout rationale: they are
/// carried in the vault file header so future bumps remain openable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    /// Number of passes over memory.
    pub time_cost: u32,
    /// Memory usage in KiB.
    pub memory_kib: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            time_cost: 2,
            memory_kib: 100 * 1024,
            parallelism: 8,
        }
    }
}

/// Derive a 32-byte key from `passphrase` and `salt` using Argon2id.
pub fn argon2id(
    passphrase: &[u8],
    salt: &[u8],
    params: Argon2Params,
) -> Result<[u8; 32], CryptoError> {
    let argon2_params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(32),
    )
    .map_err(|e| CryptoError::InvalidKdfParams(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut out = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut out)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(out)
}

/// HKDF-SHA256 extract-then-expand over `ikm`, producing `len` bytes.
pub fn hkdf(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = vec![0u8; len];
    hk.expand(info, &mut out)
        .map_err(|_| CryptoError::KeyDerivationFailed)?;
    Ok(out)
}

/// HKDF-SHA256 producing exactly 32 bytes, the common case for session and
/// rekey derivation.
pub fn hkdf32(ikm: &[u8], salt: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut bytes = hkdf(ikm, salt, info, 32)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(out)
}
