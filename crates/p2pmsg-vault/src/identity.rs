//! The endpoint's long-term identity (§3 "Identity").

use p2pmsg_crypto::hash::Fingerprint;
use p2pmsg_crypto::kdf::hkdf32;
use p2pmsg_crypto::signatures::{SigningKey, VerifyingKey};
use p2pmsg_crypto::x25519::{PrivateKey as ExchangePrivateKey, PublicKey as ExchangePublicKey};
use p2pmsg_crypto::CryptoError;
use zeroize::Zeroize;

const LOG_KEY_SALT: &[u8] = b"log-salt-v1";
const LOG_KEY_INFO: &[u8] = b"msg-log";

/// The two long-term keypairs that make up a stable endpoint identity.
///
/// The X25519 keypair here is the long-term *exchange* keypair from §3's data
/// model; the handshake engine (§4.D) never uses it directly — each session
/// negotiates a fresh ephemeral X25519 keypair for forward secrecy. It is
/// carried through the vault for API completeness and so a future protocol
/// revision has a stable long-term DH key available without a vault format
/// change (see DESIGN.md).
pub struct Identity {
    signing_key: SigningKey,
    exchange_key: ExchangePrivateKey,
    fingerprint: Fingerprint,
    created_at: u64,
}

impl Identity {
    /// Construct an identity from its two private keys.
    #[must_use]
    pub fn new(signing_key: SigningKey, exchange_key: ExchangePrivateKey, created_at: u64) -> Self {
        let fingerprint = Fingerprint::of(&signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            exchange_key,
            fingerprint,
            created_at,
        }
    }

    /// The Ed25519 verifying (public) key.
    #[must_use]
    pub fn identity_public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// The long-term X25519 public key.
    #[must_use]
    pub fn exchange_public_key(&self) -> ExchangePublicKey {
        self.exchange_key.public_key()
    }

    /// `SHA-256(identity_public_key)`.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Unix timestamp this identity was created.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Sign a message with the long-term identity signing key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> p2pmsg_crypto::signatures::Signature {
        self.signing_key.sign(message)
    }

    /// Borrow the long-term exchange private key.
    #[must_use]
    pub fn exchange_private_key(&self) -> &ExchangePrivateKey {
        &self.exchange_key
    }

    /// Derive the message-log encryption key (§4.G): `HKDF(identity_private_bytes,
    /// salt="log-salt-v1", info="msg-log", 32)`.
    ///
    /// The raw signing key bytes touch memory only for this call and are
    /// zeroized immediately afterward (§3 invariant 1).
    pub fn derive_log_key(&self) -> Result<[u8; 32], CryptoError> {
        let mut raw = self.signing_key.to_bytes();
        let key = hkdf32(&raw, LOG_KEY_SALT, LOG_KEY_INFO);
        raw.zeroize();
        key
    }
}
