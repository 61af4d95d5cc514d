//! SHA-256 fingerprinting of identity public keys.

use sha2::{Digest, Sha256};

/// A fingerprint: the raw SHA-256 digest of an identity public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of a 32-byte Ed25519 public key.
    #[must_use]
    pub fn of(identity_public_key: &[u8; 32]) -> Self {
        let digest = Sha256::digest(identity_public_key);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, colon-separated in 2-byte groups, e.g. `a1:b2:...`.
    #[must_use]
    pub fn display(&self) -> String {
        self.0
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Parse the colon-separated display form back into a fingerprint.
    pub fn parse(s: &str) -> Option<Self> {
        let cleaned: String = s.chars().filter(|c| *c != ':').collect();
        let bytes = hex::decode(cleaned).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Some(Self(out))
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable() {
        let key = [0x11u8; 32];
        assert_eq!(Fingerprint::of(&key).as_bytes(), Fingerprint::of(&key).as_bytes());
    }

    #[test]
    fn display_round_trips() {
        let key = [0xabu8; 32];
        let fp = Fingerprint::of(&key);
        let s = fp.display();
        assert_eq!(s.len(), 32 * 2 + 31);
        let parsed = Fingerprint::parse(&s).unwrap();
        assert_eq!(parsed.as_bytes(), fp.as_bytes());
    }
}
