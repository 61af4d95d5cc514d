//! The four-step authenticated key agreement handshake engine (§4.D).
//!
//! ```text
//! I (initiator)                          R (responder)
//!   --------- HELLO ------------------------>
//!   <-------- HELLO_ACK ----------------------
//!   --------- CHALLENGE_RESPONSE ------------>
//!   <-------- READY ---------------------------
//! ```
//!
//! Both sides derive the session key as soon as they know both ephemeral
//! public keys, then hand that key straight to a [`RecordLayer`]: the
//! `CHALLENGE_RESPONSE` and `READY` frames are themselves the first two
//! AEAD-protected frames of the session (counter 0 on each direction), so
//! the record layer's nonce/replay bookkeeping is never duplicated here.

use std::sync::Arc;

use p2pmsg_crypto::hash::Fingerprint;
use p2pmsg_crypto::kdf::hkdf32;
use p2pmsg_crypto::random::random;
use p2pmsg_crypto::signatures::{Signature, VerifyingKey};
use p2pmsg_crypto::x25519::{PrivateKey as EphemeralPrivateKey, PublicKey as EphemeralPublicKey};
use p2pmsg_vault::Identity;
use rand_core::OsRng;

use crate::error::ProtocolError;
use crate::frame::{Frame, MessageType, RecordPayload};
use crate::record::RecordLayer;
use crate::Config;

/// Which side of the handshake this engine is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The dialer; sends `HELLO` first.
    Initiator,
    /// The listener; waits for `HELLO`.
    Responder,
}

/// Handshake state machine states (§4.D's state table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No handshake activity yet.
    Idle,
    /// Responder: accepted the connection, waiting for `HELLO`.
    WaitHello,
    /// Initiator: sent `HELLO`, waiting for `HELLO_ACK`.
    SentHello,
    /// Responder: sent `HELLO_ACK`, waiting for `CHALLENGE_RESPONSE`.
    SentAck,
    /// Initiator: sent `CHALLENGE_RESPONSE`, waiting for `READY`.
    SentChallenge,
    /// Handshake complete; a [`RecordLayer`] has been derived.
    Established,
    /// A timeout or validation failure occurred; the connection is closed.
    Failed,
}

/// A pluggable trust-on-first-use store (§4.D's TOFU pinning rule).
///
/// Implementations are keyed by an opaque `context` string rather than by
/// fingerprint, because the fingerprint is exactly the value under
/// validation: the connection manager supplies a context that identifies
/// *which* relationship is being continued — `"listen:<port>"` for an
/// inbound listener, `"dial:<addr>:<port>"` for an outbound target — and
/// this store remembers which identity key was last accepted for it.
pub trait PeerPinStore: Send {
    /// The identity public key last pinned for `context`, if any.
    fn lookup(&self, context: &str) -> Option<[u8; 32]>;
    /// Record `identity_public_key` as the pinned key for `context`.
    fn pin(&mut self, context: &str, identity_public_key: [u8; 32]);
}

/// An in-memory [`PeerPinStore`], the default for tests and for a process
/// that doesn't yet have `p2pmsg-store` wired in.
#[derive(Default)]
pub struct MemoryPinStore {
    pinned: std::collections::HashMap<String, [u8; 32]>,
}

impl PeerPinStore for MemoryPinStore {
    fn lookup(&self, context: &str) -> Option<[u8; 32]> {
        self.pinned.get(context).copied()
    }

    fn pin(&mut self, context: &str, identity_public_key: [u8; 32]) {
        self.pinned.insert(context.to_string(), identity_public_key);
    }
}

/// The result of successfully completing the handshake.
pub struct EstablishedSession {
    /// The record layer, ready to seal/open application frames.
    pub record_layer: RecordLayer,
    /// The peer's identity fingerprint.
    pub peer_fingerprint: Fingerprint,
    /// The peer's raw identity public key.
    pub peer_identity_public_key: [u8; 32],
    /// Whether this is the first time this pin context has seen this peer.
    pub first_contact: bool,
}

/// The outcome of feeding one inbound frame to the engine.
pub struct HandshakeStep {
    /// A frame the caller must send to the peer to continue the handshake.
    pub reply: Option<Frame>,
    /// Set once the handshake reaches `Established`.
    pub established: Option<EstablishedSession>,
}

const HELLO_CONTEXT: &[u8] = b"HELLO";
const ACK_CONTEXT: &[u8] = b"ACK";
const SESSION_INFO: &[u8] = b"p2pmsg v1 session";

/// Drives one side of the four-step authenticated key agreement.
pub struct HandshakeEngine {
    role: Role,
    state: State,
    identity: Arc<Identity>,
    config: Config,
    pin_context: String,

    own_ephemeral_sk: Option<EphemeralPrivateKey>,
    own_ephemeral_pk: Option<EphemeralPublicKey>,
    peer_ephemeral_pk: Option<EphemeralPublicKey>,
    peer_identity_pk: Option<VerifyingKey>,
    peer_fingerprint: Option<Fingerprint>,
    challenge: Option<[u8; 32]>,
    record_layer: Option<RecordLayer>,
    first_contact: bool,
}

impl HandshakeEngine {
    /// A fresh engine for one connection, in the `Idle` state.
    #[must_use]
    pub fn new(role: Role, identity: Arc<Identity>, config: Config, pin_context: String) -> Self {
        Self {
            role,
            state: State::Idle,
            identity,
            config,
            pin_context,
            own_ephemeral_sk: None,
            own_ephemeral_pk: None,
            peer_ephemeral_pk: None,
            peer_identity_pk: None,
            peer_fingerprint: None,
            challenge: None,
            record_layer: None,
            first_contact: false,
        }
    }

    /// Current state machine state.
    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    fn fail(&mut self) -> ProtocolError {
        self.state = State::Failed;
        ProtocolError::UnexpectedState
    }

    /// Initiator: generate an ephemeral keypair and emit `HELLO`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedState`] if called outside `Idle`,
    /// or a CSPRNG failure wrapped as `BadFrame`.
    pub fn start(&mut self) -> Result<Frame, ProtocolError> {
        if self.role != Role::Initiator || self.state != State::Idle {
            return Err(self.fail());
        }
        let ephemeral_sk = EphemeralPrivateKey::generate(&mut OsRng);
        let ephemeral_pk = ephemeral_sk.public_key();

        let identity_pub = self.identity.identity_public_key().to_bytes();
        let mut signed = Vec::with_capacity(32 + 32 + HELLO_CONTEXT.len());
        signed.extend_from_slice(&identity_pub);
        signed.extend_from_slice(ephemeral_pk.as_bytes());
        signed.extend_from_slice(HELLO_CONTEXT);
        let signature = self.identity.sign(&signed);

        let mut payload = Vec::with_capacity(32 + 32 + 64);
        payload.extend_from_slice(&identity_pub);
        payload.extend_from_slice(ephemeral_pk.as_bytes());
        payload.extend_from_slice(signature.as_bytes());

        self.own_ephemeral_sk = Some(ephemeral_sk);
        self.own_ephemeral_pk = Some(ephemeral_pk);
        self.state = State::SentHello;
        Ok(Frame::new(MessageType::Hello, payload))
    }

    /// Responder: move to `WaitHello`. No frame is emitted.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnexpectedState`] if called outside `Idle`.
    pub fn accept(&mut self) -> Result<(), ProtocolError> {
        if self.role != Role::Responder || self.state != State::Idle {
            return Err(self.fail());
        }
        self.state = State::WaitHello;
        Ok(())
    }

    /// Feed one inbound frame to the engine, advancing the state machine.
    ///
    /// # Errors
    ///
    /// Any frame that is not the expected type for the current state, or
    /// that fails signature/AEAD/pinning validation, transitions to `Failed`
    /// and returns the specific [`ProtocolError`].
    pub fn receive(
        &mut self,
        frame: Frame,
        now_unix: u64,
        pins: &mut dyn PeerPinStore,
    ) -> Result<HandshakeStep, ProtocolError> {
        match (self.state, frame.msg_type) {
            (State::WaitHello, MessageType::Hello) => self.on_hello(&frame.payload, pins),
            (State::SentHello, MessageType::HelloAck) => self.on_hello_ack(&frame.payload, now_unix, pins),
            (State::SentAck, MessageType::ChallengeResponse) => {
                self.on_challenge_response(&frame.payload, now_unix)
            }
            (State::SentChallenge, MessageType::Ready) => self.on_ready(&frame.payload, now_unix),
            _ => Err(self.fail()),
        }
    }

    fn check_pin(&mut self, identity_pub: [u8; 32], pins: &mut dyn PeerPinStore) -> Result<bool, ProtocolError> {
        match pins.lookup(&self.pin_context) {
            Some(expected) if expected != identity_pub => {
                self.state = State::Failed;
                Err(ProtocolError::IdentityMismatch)
            }
            Some(_) => Ok(false),
            None => {
                pins.pin(&self.pin_context, identity_pub);
                Ok(true)
            }
        }
    }

    fn derive_session_key(&self, local_pk: &EphemeralPublicKey, peer_pk: &EphemeralPublicKey) -> Result<[u8; 32], ProtocolError> {
        let shared = self
            .own_ephemeral_sk
            .as_ref()
            .expect("ephemeral key set before deriving session key")
            .exchange(peer_pk)
            .ok_or(ProtocolError::BadFrame("low-order ephemeral public key".into()))?;

        let (a, b) = (local_pk.to_bytes(), peer_pk.to_bytes());
        let mut salt = Vec::with_capacity(64);
        if a <= b {
            salt.extend_from_slice(&a);
            salt.extend_from_slice(&b);
        } else {
            salt.extend_from_slice(&b);
            salt.extend_from_slice(&a);
        }

        hkdf32(shared.as_bytes(), &salt, SESSION_INFO)
            .map_err(|_| ProtocolError::BadFrame("session key derivation failed".into()))
    }

    fn on_hello(&mut self, payload: &[u8], pins: &mut dyn PeerPinStore) -> Result<HandshakeStep, ProtocolError> {
        if payload.len() != 32 + 32 + 64 {
            return Err(self.fail());
        }
        let peer_identity_bytes: [u8; 32] = payload[0..32].try_into().unwrap();
        let peer_ephemeral_bytes: [u8; 32] = payload[32..64].try_into().unwrap();
        let signature = Signature::from_slice(&payload[64..128]).map_err(|_| self.fail())?;

        let peer_identity_pk = VerifyingKey::from_bytes(&peer_identity_bytes).map_err(|_| self.fail())?;

        let mut signed = Vec::with_capacity(128);
        signed.extend_from_slice(&peer_identity_bytes);
        signed.extend_from_slice(&peer_ephemeral_bytes);
        signed.extend_from_slice(HELLO_CONTEXT);
        if peer_identity_pk.verify(&signed, &signature).is_err() {
            self.state = State::Failed;
            return Err(ProtocolError::BadSignature);
        }

        self.first_contact = self.check_pin(peer_identity_bytes, pins)?;

        let peer_ephemeral_pk = EphemeralPublicKey::from_bytes(peer_ephemeral_bytes);
        let own_ephemeral_sk = EphemeralPrivateKey::generate(&mut OsRng);
        let own_ephemeral_pk = own_ephemeral_sk.public_key();

        let challenge_vec = random(32).map_err(|_| self.fail())?;
        let mut challenge = [0u8; 32];
        challenge.copy_from_slice(&challenge_vec);

        let identity_pub = self.identity.identity_public_key().to_bytes();
        let mut signed_ack = Vec::with_capacity(32 + 32 + 32 + ACK_CONTEXT.len());
        signed_ack.extend_from_slice(&identity_pub);
        signed_ack.extend_from_slice(own_ephemeral_pk.as_bytes());
        signed_ack.extend_from_slice(&challenge);
        signed_ack.extend_from_slice(ACK_CONTEXT);
        let signature = self.identity.sign(&signed_ack);

        let mut ack_payload = Vec::with_capacity(32 + 32 + 32 + 64);
        ack_payload.extend_from_slice(&identity_pub);
        ack_payload.extend_from_slice(own_ephemeral_pk.as_bytes());
        ack_payload.extend_from_slice(&challenge);
        ack_payload.extend_from_slice(signature.as_bytes());

        self.own_ephemeral_sk = Some(own_ephemeral_sk);
        self.own_ephemeral_pk = Some(own_ephemeral_pk);
        self.peer_ephemeral_pk = Some(peer_ephemeral_pk);
        self.peer_identity_pk = Some(peer_identity_pk);
        self.peer_fingerprint = Some(Fingerprint::of(&peer_identity_bytes));
        self.challenge = Some(challenge);

        let session_key = self.derive_session_key(&own_ephemeral_pk, &peer_ephemeral_pk)?;
        let local_fp = self.identity.fingerprint();
        self.record_layer = Some(RecordLayer::new(
            session_key,
            self.role,
            *local_fp.as_bytes(),
            *self.peer_fingerprint.unwrap().as_bytes(),
            &self.config,
        ));

        self.state = State::SentAck;
        Ok(HandshakeStep {
            reply: Some(Frame::new(MessageType::HelloAck, ack_payload)),
            established: None,
        })
    }

    fn on_hello_ack(
        &mut self,
        payload: &[u8],
        now_unix: u64,
        pins: &mut dyn PeerPinStore,
    ) -> Result<HandshakeStep, ProtocolError> {
        if payload.len() != 32 + 32 + 32 + 64 {
            return Err(self.fail());
        }
        let peer_identity_bytes: [u8; 32] = payload[0..32].try_into().unwrap();
        let peer_ephemeral_bytes: [u8; 32] = payload[32..64].try_into().unwrap();
        let challenge: [u8; 32] = payload[64..96].try_into().unwrap();
        let signature = Signature::from_slice(&payload[96..160]).map_err(|_| self.fail())?;

        let peer_identity_pk = VerifyingKey::from_bytes(&peer_identity_bytes).map_err(|_| self.fail())?;

        let mut signed = Vec::with_capacity(128);
        signed.extend_from_slice(&peer_identity_bytes);
        signed.extend_from_slice(&peer_ephemeral_bytes);
        signed.extend_from_slice(&challenge);
        signed.extend_from_slice(ACK_CONTEXT);
        if peer_identity_pk.verify(&signed, &signature).is_err() {
            self.state = State::Failed;
            return Err(ProtocolError::BadSignature);
        }

        self.first_contact = self.check_pin(peer_identity_bytes, pins)?;

        let peer_ephemeral_pk = EphemeralPublicKey::from_bytes(peer_ephemeral_bytes);
        let own_ephemeral_pk = self.own_ephemeral_pk.expect("set in start()");

        self.peer_ephemeral_pk = Some(peer_ephemeral_pk);
        self.peer_identity_pk = Some(peer_identity_pk);
        self.peer_fingerprint = Some(Fingerprint::of(&peer_identity_bytes));

        let session_key = self.derive_session_key(&own_ephemeral_pk, &peer_ephemeral_pk)?;
        let local_fp = self.identity.fingerprint();
        let mut record_layer = RecordLayer::new(
            session_key,
            self.role,
            *local_fp.as_bytes(),
            *self.peer_fingerprint.unwrap().as_bytes(),
            &self.config,
        );

        let response_signature = self.identity.sign(&challenge);
        let sealed = record_layer
            .seal(MessageType::ChallengeResponse, response_signature.as_bytes(), now_unix)?
            .payload;
        self.record_layer = Some(record_layer);

        self.state = State::SentChallenge;
        Ok(HandshakeStep {
            reply: Some(Frame::new(MessageType::ChallengeResponse, sealed.encode())),
            established: None,
        })
    }

    fn on_challenge_response(&mut self, payload: &[u8], now_unix: u64) -> Result<HandshakeStep, ProtocolError> {
        let sealed = match RecordPayload::decode(payload) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.state = State::Failed;
                return Err(e);
            }
        };

        let plaintext = {
            let record_layer = self.record_layer.as_mut().expect("derived in on_hello");
            match record_layer.open(MessageType::ChallengeResponse, &sealed, now_unix) {
                Ok(plaintext) => plaintext,
                Err(_) => {
                    self.state = State::Failed;
                    return Err(ProtocolError::BadChallengeResponse);
                }
            }
        };

        let signature = match Signature::from_slice(&plaintext) {
            Ok(signature) => signature,
            Err(_) => {
                self.state = State::Failed;
                return Err(ProtocolError::BadChallengeResponse);
            }
        };
        let challenge = self.challenge.expect("set in on_hello");
        let peer_identity_pk = *self.peer_identity_pk.as_ref().expect("set in on_hello");
        if peer_identity_pk.verify(&challenge, &signature).is_err() {
            self.state = State::Failed;
            return Err(ProtocolError::BadChallengeResponse);
        }

        let ready = {
            let record_layer = self.record_layer.as_mut().expect("derived in on_hello");
            record_layer.seal(MessageType::Ready, &[], now_unix)?.payload
        };
        self.state = State::Established;

        Ok(HandshakeStep {
            reply: Some(Frame::new(MessageType::Ready, ready.encode())),
            established: Some(EstablishedSession {
                record_layer: self.record_layer.take().unwrap(),
                peer_fingerprint: self.peer_fingerprint.unwrap(),
                peer_identity_public_key: self.peer_identity_pk.as_ref().unwrap().to_bytes(),
                first_contact: self.first_contact,
            }),
        })
    }

    fn on_ready(&mut self, payload: &[u8], now_unix: u64) -> Result<HandshakeStep, ProtocolError> {
        let sealed = match RecordPayload::decode(payload) {
            Ok(sealed) => sealed,
            Err(e) => {
                self.state = State::Failed;
                return Err(e);
            }
        };

        {
            let record_layer = self.record_layer.as_mut().expect("derived in on_hello_ack");
            if record_layer.open(MessageType::Ready, &sealed, now_unix).is_err() {
                self.state = State::Failed;
                return Err(ProtocolError::AuthFail);
            }
        }

        self.state = State::Established;
        Ok(HandshakeStep {
            reply: None,
            established: Some(EstablishedSession {
                record_layer: self.record_layer.take().unwrap(),
                peer_fingerprint: self.peer_fingerprint.unwrap(),
                peer_identity_public_key: self.peer_identity_pk.as_ref().unwrap().to_bytes(),
                first_contact: self.first_contact,
            }),
        })
    }
}
