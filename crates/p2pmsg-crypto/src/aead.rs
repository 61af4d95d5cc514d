//! ChaCha20-Poly1305 AEAD encryption.
//!
//! The record layer's 96-bit nonces are never random (they are derived from a
//! per-direction counter), so plain ChaCha20-Poly1305 rather than the extended
//! XChaCha20 variant is the correct fit here: nonce uniqueness is the caller's
//! responsibility, enforced by the record layer's counter discipline.

use chacha20poly1305::{
    ChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// Key size in bytes.
pub const KEY_SIZE: usize = 32;
/// Nonce size in bytes.
pub const NONCE_SIZE: usize = 12;
/// Authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// A 256-bit AEAD key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// AEAD cipher bound to a single key.
pub struct AeadCipher {
    cipher: ChaCha20Poly1305,
}

impl AeadCipher {
    /// Construct a cipher from a key.
    #[must_use]
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Seal `plaintext`, producing `ciphertext || tag`.
    pub fn seal(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(nonce.into(), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Open `ciphertext || tag`, returning the plaintext.
    ///
    /// Fails closed: any authentication failure returns
    /// [`CryptoError::DecryptionFailed`] and nothing is written to `out`.
    pub fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(nonce.into(), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = AeadKey::new([0x42u8; 32]);
        let nonce = [0u8; NONCE_SIZE];
        let cipher = AeadCipher::new(&key);

        let ct = cipher.seal(&nonce, b"aad", b"hello").unwrap();
        let pt = cipher.open(&nonce, b"aad", &ct).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn tamper_detected() {
        let key = AeadKey::new([0x42u8; 32]);
        let nonce = [0u8; NONCE_SIZE];
        let cipher = AeadCipher::new(&key);

        let mut ct = cipher.seal(&nonce, b"aad", b"hello").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(cipher.open(&nonce, b"aad", &ct).is_err());
    }

    #[test]
    fn wrong_aad_detected() {
        let key = AeadKey::new([0x42u8; 32]);
        let nonce = [0u8; NONCE_SIZE];
        let cipher = AeadCipher::new(&key);

        let ct = cipher.seal(&nonce, b"aad-a", b"hello").unwrap();
        assert!(cipher.open(&nonce, b"aad-b", &ct).is_err());
    }
}
