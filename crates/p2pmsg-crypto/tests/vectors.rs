//! Cryptographic test vectors from official specifications.
//!
//! These vectors ensure our wrappers exercise the underlying primitives the
//! way the specification expects, not just "some curve" or "some cipher".

use p2pmsg_crypto::x25519::{PrivateKey, PublicKey};

// RFC 7748 Section 5.2 - Test Vector 1
#[test]
fn x25519_rfc7748_vector_1() {
    let scalar_bytes = [
        0xa5, 0x46, 0xe3, 0x6b, 0xf0, 0x52, 0x7c, 0x9d, 0x3b, 0x16, 0x15, 0x4b, 0x82, 0x46, 0x5e,
        0xdd, 0x62, 0x14, 0x4c, 0x0a, 0xc1, 0xfc, 0x5a, 0x18, 0x50, 0x6a, 0x22, 0x44, 0xba, 0x44,
        0x9a, 0xc4,
    ];
    let basepoint_bytes = [
        0xe6, 0xdb, 0x68, 0x67, 0x58, 0x30, 0x30, 0xdb, 0x35, 0x94, 0xc1, 0xa4, 0x24, 0xb1, 0x5f,
        0x7c, 0x72, 0x66, 0x24, 0xec, 0x26, 0xb3, 0x35, 0x3b, 0x10, 0xa9, 0x03, 0xa6, 0xd0, 0xab,
        0x1c, 0x4c,
    ];
    let expected_bytes = [
        0xc3, 0xda, 0x55, 0x37, 0x9d, 0xe9, 0xc6, 0x90, 0x8e, 0x94, 0xea, 0x4d, 0xf2, 0x8d, 0x08,
        0x4f, 0x32, 0xec, 0xcf, 0x03, 0x49, 0x1c, 0x71, 0xf7, 0x54, 0xb4, 0x07, 0x55, 0x77, 0xa2,
        0x85, 0x52,
    ];

    let private = PrivateKey::from_bytes(scalar_bytes);
    let public = PublicKey::from_bytes(basepoint_bytes);
    let shared = private.exchange(&public).unwrap();

    assert_eq!(shared.as_bytes(), &expected_bytes);
}

#[test]
fn x25519_shared_secret_is_symmetric() {
    use rand_core::OsRng;

    let a = PrivateKey::generate(&mut OsRng);
    let b = PrivateKey::generate(&mut OsRng);

    let ab = a.exchange(&b.public_key()).unwrap();
    let ba = b.exchange(&a.public_key()).unwrap();

    assert_eq!(ab.as_bytes(), ba.as_bytes());
}
