//! Key vault operations: `initialize`, `open`, `rotate_passphrase` (§4.B).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use p2pmsg_crypto::aead::{AeadCipher, AeadKey};
use p2pmsg_crypto::kdf::{argon2id, Argon2Params};
use p2pmsg_crypto::random::random;
use p2pmsg_crypto::signatures::SigningKey;
use p2pmsg_crypto::x25519::PrivateKey as ExchangePrivateKey;
use rand_core::OsRng;
use zeroize::Zeroize;

use crate::error::VaultError;
use crate::format::{KeyRecord, KeyType};
use crate::identity::Identity;

const IDENTITY_FILE: &str = "identity.key";
const EXCHANGE_FILE: &str = "exchange.key";
const SEAL_AAD: &[u8] = b"p2pmsg vault v1";

/// A passphrase-protected store of the endpoint's two long-term private keys.
pub struct KeyVault {
    dir: PathBuf,
}

impl KeyVault {
    /// A vault rooted at `dir` (typically `data/vault`).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    fn exchange_path(&self) -> PathBuf {
        self.dir.join(EXCHANGE_FILE)
    }

    fn exists(&self) -> bool {
        self.identity_path().exists() || self.exchange_path().exists()
    }

    /// Generate both long-term keypairs, seal them under a passphrase-derived
    /// vault key, and persist them. Fails with [`VaultError::Exists`] if a
    /// vault is already present at this path.
    ///
    /// Uses [`Argon2Params::default`] (§4.B's fixed parameters). Call
    /// [`Self::initialize_with_params`] to override them, e.g. from a
    /// caller-supplied [`p2pmsg_core::Config`]'s `argon2_*` fields.
    pub fn initialize(&self, passphrase: &[u8]) -> Result<Identity, VaultError> {
        self.initialize_with_params(passphrase, Argon2Params::default())
    }

    /// As [`Self::initialize`], but with explicit Argon2id parameters. The
    /// chosen parameters are stored in each key file's header (§4.B
    /// "Rationale"), so a later parameter bump never breaks `open()`.
    pub fn initialize_with_params(&self, passphrase: &[u8], params: Argon2Params) -> Result<Identity, VaultError> {
        if self.exists() {
            return Err(VaultError::Exists(self.dir.clone()));
        }
        fs::create_dir_all(&self.dir)?;

        let signing_key = SigningKey::generate(&mut OsRng);
        let exchange_key = ExchangePrivateKey::generate(&mut OsRng);
        let created_at = now();

        write_sealed_record(
            &self.identity_path(),
            KeyType::Identity,
            &signing_key.to_bytes(),
            &signing_key.verifying_key().to_bytes(),
            passphrase,
            params,
            created_at,
        )?;
        write_sealed_record(
            &self.exchange_path(),
            KeyType::Exchange,
            &exchange_key.to_bytes(),
            exchange_key.public_key().as_bytes(),
            passphrase,
            params,
            created_at,
        )?;

        Ok(Identity::new(signing_key, exchange_key, created_at))
    }

    /// Load and unseal both long-term keys.
    ///
    /// Fails fast with [`VaultError::BadPassphrase`] if neither record
    /// authenticates under its candidate vault key, or [`VaultError::Corrupt`]
    /// if exactly one does (which, since both records are derived from the
    /// same passphrase, can only mean on-disk tampering or truncation of the
    /// other).
    pub fn open(&self, passphrase: &[u8]) -> Result<Identity, VaultError> {
        if !self.exists() {
            return Err(VaultError::NotFound(self.dir.clone()));
        }

        let identity_record = read_record(&self.identity_path())?;
        let exchange_record = read_record(&self.exchange_path())?;

        let identity_result = unseal(&identity_record, passphrase);
        let exchange_result = unseal(&exchange_record, passphrase);

        let (identity_bytes, exchange_bytes) = match (identity_result, exchange_result) {
            (Ok(i), Ok(e)) => (i, e),
            (Err(_), Err(_)) => return Err(VaultError::BadPassphrase),
            (Err(_), Ok(_)) => return Err(VaultError::Corrupt("identity.key".into())),
            (Ok(_), Err(_)) => return Err(VaultError::Corrupt("exchange.key".into())),
        };

        let mut identity_bytes32 = [0u8; 32];
        identity_bytes32.copy_from_slice(&identity_bytes);
        let mut exchange_bytes32 = [0u8; 32];
        exchange_bytes32.copy_from_slice(&exchange_bytes);

        let signing_key = SigningKey::from_bytes(&identity_bytes32);
        let exchange_key = ExchangePrivateKey::from_bytes(exchange_bytes32);

        identity_bytes32.zeroize();
        exchange_bytes32.zeroize();

        Ok(Identity::new(signing_key, exchange_key, identity_record.created_at))
    }

    /// Open with the old passphrase, re-seal both records under a fresh salt
    /// and the new passphrase, and atomically replace the files.
    ///
    /// Operates on the raw unsealed bytes rather than routing through
    /// [`Identity`] — rotation never needs to reconstruct key objects, only
    /// to re-seal the same private bytes under a new vault key. Re-seals
    /// under [`Argon2Params::default`]; use [`Self::rotate_passphrase_with_params`]
    /// to pick up a different parameter set.
    pub fn rotate_passphrase(&self, old: &[u8], new: &[u8]) -> Result<(), VaultError> {
        self.rotate_passphrase_with_params(old, new, Argon2Params::default())
    }

    /// As [`Self::rotate_passphrase`], but with explicit Argon2id parameters
    /// for the re-sealed records.
    pub fn rotate_passphrase_with_params(&self, old: &[u8], new: &[u8], params: Argon2Params) -> Result<(), VaultError> {
        if !self.exists() {
            return Err(VaultError::NotFound(self.dir.clone()));
        }

        let identity_record = read_record(&self.identity_path())?;
        let exchange_record = read_record(&self.exchange_path())?;

        let identity_result = unseal(&identity_record, old);
        let exchange_result = unseal(&exchange_record, old);

        let (mut identity_bytes, mut exchange_bytes) = match (identity_result, exchange_result) {
            (Ok(i), Ok(e)) => (i, e),
            (Err(_), Err(_)) => return Err(VaultError::BadPassphrase),
            (Err(_), Ok(_)) => return Err(VaultError::Corrupt("identity.key".into())),
            (Ok(_), Err(_)) => return Err(VaultError::Corrupt("exchange.key".into())),
        };

        write_sealed_record(
            &tmp_path(&self.identity_path()),
            KeyType::Identity,
            &identity_bytes,
            &identity_record.public_key,
            new,
            params,
            identity_record.created_at,
        )?;
        write_sealed_record(
            &tmp_path(&self.exchange_path()),
            KeyType::Exchange,
            &exchange_bytes,
            &exchange_record.public_key,
            new,
            params,
            exchange_record.created_at,
        )?;
        identity_bytes.zeroize();
        exchange_bytes.zeroize();

        fs::rename(tmp_path(&self.identity_path()), self.identity_path())?;
        fs::rename(tmp_path(&self.exchange_path()), self.exchange_path())?;
        Ok(())
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_secs()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.as_os_str().to_owned();
    p.push(".tmp");
    PathBuf::from(p)
}

#[allow(clippy::too_many_arguments)]
fn write_sealed_record(
    path: &Path,
    key_type: KeyType,
    private_key: &[u8; 32],
    public_key: &[u8],
    passphrase: &[u8],
    params: Argon2Params,
    created_at: u64,
) -> Result<(), VaultError> {
    let salt = random(16)?;
    let nonce_bytes = random(12)?;
    let mut salt16 = [0u8; 16];
    salt16.copy_from_slice(&salt);
    let mut nonce12 = [0u8; 12];
    nonce12.copy_from_slice(&nonce_bytes);

    let mut vault_key_bytes = argon2id(passphrase, &salt16, params)?;
    let vault_key = AeadKey::new(vault_key_bytes);
    vault_key_bytes.zeroize();
    let cipher = AeadCipher::new(&vault_key);

    let sealed_private_key = cipher.seal(&nonce12, SEAL_AAD, private_key)?;

    let record = KeyRecord {
        key_type,
        salt: salt16,
        nonce: nonce12,
        kdf_params: params,
        sealed_private_key,
        public_key: public_key.to_vec(),
        created_at,
    };

    fs::write(path, record.to_bytes())?;
    set_owner_only(path)?;
    Ok(())
}

fn read_record(path: &Path) -> Result<KeyRecord, VaultError> {
    let bytes = fs::read(path)?;
    KeyRecord::from_bytes(&bytes)
}

/// Returns the raw private key bytes on success, or an error on
/// authentication failure (wrong passphrase or tampered ciphertext).
fn unseal(record: &KeyRecord, passphrase: &[u8]) -> Result<[u8; 32], VaultError> {
    let mut vault_key_bytes = argon2id(passphrase, &record.salt, record.kdf_params)?;
    let vault_key = AeadKey::new(vault_key_bytes);
    vault_key_bytes.zeroize();
    let cipher = AeadCipher::new(&vault_key);

    let plaintext = cipher.open(&record.nonce, SEAL_AAD, &record.sealed_private_key)?;
    if plaintext.len() != 32 {
        return Err(VaultError::Corrupt("unexpected private key length".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}

#[cfg(unix)]
fn set_owner_only(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) -> Result<(), VaultError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn initialize_then_open_same_passphrase() {
        let dir = tempdir().unwrap();
        let vault = KeyVault::new(dir.path());

        let created = vault.initialize(b"pw-A").unwrap();
        let opened = vault.open(b"pw-A").unwrap();

        assert_eq!(created.fingerprint().as_bytes(), opened.fingerprint().as_bytes());
        assert_eq!(
            created.identity_public_key().to_bytes(),
            opened.identity_public_key().to_bytes()
        );
    }

    #[test]
    fn initialize_twice_fails() {
        let dir = tempdir().unwrap();
        let vault = KeyVault::new(dir.path());
        vault.initialize(b"pw").unwrap();
        assert!(matches!(vault.initialize(b"pw"), Err(VaultError::Exists(_))));
    }

    #[test]
    fn wrong_passphrase_fails() {
        let dir = tempdir().unwrap();
        let vault = KeyVault::new(dir.path());
        vault.initialize(b"correct").unwrap();
        assert!(matches!(vault.open(b"incorrect"), Err(VaultError::BadPassphrase)));
    }

    #[test]
    fn rotate_passphrase_then_old_fails_new_succeeds() {
        let dir = tempdir().unwrap();
        let vault = KeyVault::new(dir.path());
        let created = vault.initialize(b"old").unwrap();

        vault.rotate_passphrase(b"old", b"new").unwrap();

        assert!(matches!(vault.open(b"old"), Err(VaultError::BadPassphrase)));
        let reopened = vault.open(b"new").unwrap();
        assert_eq!(
            reopened.identity_public_key().to_bytes(),
            created.identity_public_key().to_bytes()
        );
    }

    #[test]
    fn tampered_identity_file_is_corrupt_not_bad_passphrase() {
        let dir = tempdir().unwrap();
        let vault = KeyVault::new(dir.path());
        vault.initialize(b"pw").unwrap();

        let path = vault.identity_path();
        let mut bytes = fs::read(&path).unwrap();
        // Flip a byte inside the AEAD-sealed private key region (header is
        // magic(4)+version(1)+key_type(1)+salt(16)+nonce(12)+kdf(12)+sealed_len(4)
        // = 50 bytes, then 48 bytes of sealed ciphertext+tag), not the
        // plaintext `created_at` trailer which isn't authenticated.
        let sealed_region_offset = 60;
        bytes[sealed_region_offset] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(vault.open(b"pw"), Err(VaultError::Corrupt(_))));
    }
}
