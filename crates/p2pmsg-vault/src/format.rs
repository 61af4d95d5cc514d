//! The `VLT1` on-disk key file format (§4.B, §6).
//!
//! ```text
//! magic(4) "VLT1" || version(1) || key_type(1) || salt(16) || nonce(12)
//!   || kdf_time_cost(4) || kdf_memory_kib(4) || kdf_parallelism(4)
//!   || sealed_len(4) || sealed_bytes || public_len(2) || public_bytes
//!   || created_at(8)
//! ```
//!
//! All integers are little-endian, fixed-width, per §6. The KDF-params triple
//! is carried in the header (not just implied by a global constant) so a
//! future parameter bump stays openable against old files, per §4.B's
//! rationale note.

use p2pmsg_crypto::kdf::Argon2Params;

use crate::error::VaultError;

/// File magic: `VLT1`.
pub const MAGIC: [u8; 4] = *b"VLT1";
/// Current format version.
pub const VERSION: u8 = 1;

/// The key type tag stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyType {
    /// The long-term Ed25519 identity (signature) keypair.
    Identity = 0,
    /// The long-term X25519 exchange keypair.
    Exchange = 1,
}

impl TryFrom<u8> for KeyType {
    type Error = VaultError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Identity),
            1 => Ok(Self::Exchange),
            other => Err(VaultError::Corrupt(format!("unknown key_type byte {other}"))),
        }
    }
}

/// A parsed (but still sealed) key record.
pub struct KeyRecord {
    /// Which long-term key this record holds.
    pub key_type: KeyType,
    /// Argon2id salt used to derive the vault key for this record.
    pub salt: [u8; 16],
    /// AEAD nonce used to seal the private key.
    pub nonce: [u8; 12],
    /// Argon2id parameters used for this record's vault key.
    pub kdf_params: Argon2Params,
    /// `private_key || tag`, sealed under the vault key.
    pub sealed_private_key: Vec<u8>,
    /// The public key, stored in the clear.
    pub public_key: Vec<u8>,
    /// Unix timestamp (seconds) the key was created.
    pub created_at: u64,
}

impl KeyRecord {
    /// Encode the record to its on-disk byte representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.sealed_private_key.len() + self.public_key.len());
        out.extend_from_slice(&MAGIC);
        out.push(VERSION);
        out.push(self.key_type as u8);
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.kdf_params.time_cost.to_le_bytes());
        out.extend_from_slice(&self.kdf_params.memory_kib.to_le_bytes());
        out.extend_from_slice(&self.kdf_params.parallelism.to_le_bytes());
        out.extend_from_slice(&(self.sealed_private_key.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.sealed_private_key);
        out.extend_from_slice(&(self.public_key.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.created_at.to_le_bytes());
        out
    }

    /// Parse a record from its on-disk byte representation.
    ///
    /// Any structural problem (bad magic, unknown version, truncation, an
    /// out-of-range `key_type`) is reported as [`VaultError::Corrupt`], per
    /// §4.B's rationale: corruption detection belongs to the header parser,
    /// not the passphrase check.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        let mut cursor = Cursor::new(bytes);

        let magic: [u8; 4] = cursor.take_array("magic")?;
        if magic != MAGIC {
            return Err(VaultError::Corrupt("bad magic".into()));
        }
        let version = cursor.take_u8("version")?;
        if version != VERSION {
            return Err(VaultError::Corrupt(format!("unsupported version {version}")));
        }
        let key_type = KeyType::try_from(cursor.take_u8("key_type")?)?;
        let salt: [u8; 16] = cursor.take_array("salt")?;
        let nonce: [u8; 12] = cursor.take_array("nonce")?;
        let time_cost = cursor.take_u32("kdf_time_cost")?;
        let memory_kib = cursor.take_u32("kdf_memory_kib")?;
        let parallelism = cursor.take_u32("kdf_parallelism")?;
        let sealed_len = cursor.take_u32("sealed_len")? as usize;
        let sealed_private_key = cursor.take_vec(sealed_len, "sealed_bytes")?;
        let public_len = cursor.take_u16("public_len")? as usize;
        let public_key = cursor.take_vec(public_len, "public_bytes")?;
        let created_at = cursor.take_u64("created_at")?;

        Ok(Self {
            key_type,
            salt,
            nonce,
            kdf_params: Argon2Params {
                time_cost,
                memory_kib,
                parallelism,
            },
            sealed_private_key,
            public_key,
            created_at,
        })
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8], VaultError> {
        if self.pos + n > self.bytes.len() {
            return Err(VaultError::Corrupt(format!("truncated at field {field}")));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self, field: &str) -> Result<u8, VaultError> {
        Ok(self.take(1, field)?[0])
    }

    fn take_u16(&mut self, field: &str) -> Result<u16, VaultError> {
        Ok(u16::from_le_bytes(self.take(2, field)?.try_into().unwrap()))
    }

    fn take_u32(&mut self, field: &str) -> Result<u32, VaultError> {
        Ok(u32::from_le_bytes(self.take(4, field)?.try_into().unwrap()))
    }

    fn take_u64(&mut self, field: &str) -> Result<u64, VaultError> {
        Ok(u64::from_le_bytes(self.take(8, field)?.try_into().unwrap()))
    }

    fn take_array<const N: usize>(&mut self, field: &str) -> Result<[u8; N], VaultError> {
        self.take(N, field)?.try_into().map_err(|_| VaultError::Corrupt(field.into()))
    }

    fn take_vec(&mut self, n: usize, field: &str) -> Result<Vec<u8>, VaultError> {
        Ok(self.take(n, field)?.to_vec())
    }
}
