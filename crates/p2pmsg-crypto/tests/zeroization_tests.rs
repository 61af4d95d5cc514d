//! Zeroization smoke tests.
//!
//! These cannot directly inspect freed memory, but they do verify the
//! zeroizing wrapper types compile with their `ZeroizeOnDrop` bounds and that
//! explicit zeroization leaves a buffer all-zero, which is the contract
//! `p2pmsg-vault` and the record layer depend on for secret handling.

use p2pmsg_crypto::aead::AeadKey;
use p2pmsg_crypto::kdf::hkdf32;
use p2pmsg_crypto::x25519::PrivateKey;
use zeroize::Zeroize;

#[test]
fn aead_key_drops_without_panic() {
    let key = AeadKey::new([0x42u8; 32]);
    drop(key);
}

#[test]
fn x25519_private_key_drops_without_panic() {
    use rand_core::OsRng;
    let key = PrivateKey::generate(&mut OsRng);
    drop(key);
}

#[test]
fn derived_session_key_buffer_zeroizes_explicitly() {
    let mut derived = hkdf32(&[1u8; 32], b"salt", b"p2pmsg v1 session").unwrap();
    assert_ne!(derived, [0u8; 32]);
    derived.zeroize();
    assert_eq!(derived, [0u8; 32]);
}
