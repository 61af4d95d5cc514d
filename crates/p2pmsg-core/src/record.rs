//! The AEAD record layer (§4.E): per-direction nonce discipline, the replay
//! window, rekey, and heartbeat scheduling.

use std::collections::HashSet;
use std::time::Instant;

use p2pmsg_crypto::aead::{AeadCipher, AeadKey};

use crate::config::Config;
use crate::error::ProtocolError;
use crate::frame::{record_aad, MessageType, RecordPayload, RECORD_VERSION};
use crate::handshake::Role;

/// How far before/after the receiver's own clock minute a sender's
/// `timestamp_minute` is still accepted, resolving spec Open Question (i):
/// the receiver tries every minute in this window and accepts the frame if
/// exactly one produces a valid AEAD tag.
const TIMESTAMP_SKEW_MINUTES: i64 = 5;

fn role_tag(role: Role) -> u32 {
    match role {
        Role::Initiator => 0x0000_0001,
        Role::Responder => 0x0000_0002,
    }
}

fn nonce_for(counter: u64, role: Role) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0..8].copy_from_slice(&counter.to_le_bytes());
    nonce[8..12].copy_from_slice(&role_tag(role).to_le_bytes());
    nonce
}

/// A sliding window over receive counters: each counter is accepted at most
/// once (§4.E's replay invariant).
///
/// Implemented as a pruned set rather than a literal bitmap — equivalent
/// accept/reject semantics, and simpler to get right at the conversational
/// (not bulk-transfer) throughput this system targets (§1).
pub struct ReplayWindow {
    window_size: u64,
    high: Option<u64>,
    seen: HashSet<u64>,
}

impl ReplayWindow {
    /// A fresh window of `window_size` entries.
    #[must_use]
    pub fn new(window_size: u32) -> Self {
        Self {
            window_size: window_size as u64,
            high: None,
            seen: HashSet::new(),
        }
    }

    /// Accept `counter` if it hasn't been seen before and is within the
    /// window of the highest counter accepted so far.
    pub fn accept(&mut self, counter: u64) -> Result<(), ProtocolError> {
        match self.high {
            None => {
                self.high = Some(counter);
                self.seen.insert(counter);
                Ok(())
            }
            Some(high) if counter > high => {
                self.high = Some(counter);
                self.seen.insert(counter);
                let floor = counter.saturating_sub(self.window_size);
                self.seen.retain(|&c| c > floor);
                Ok(())
            }
            Some(high) => {
                let floor = high.saturating_sub(self.window_size);
                if counter <= floor {
                    return Err(ProtocolError::Replay);
                }
                if !self.seen.insert(counter) {
                    return Err(ProtocolError::Replay);
                }
                Ok(())
            }
        }
    }
}

/// Outcome of a successful `seal`: the wire-ready payload, and whether a
/// rekey should now be scheduled (§4.E).
pub struct SealOutput {
    /// The record-layer payload to embed in the outgoing frame.
    pub payload: RecordPayload,
    /// Set once the message-count or session-age threshold is crossed.
    pub rekey_due: bool,
}

/// The established, post-handshake encrypted channel.
pub struct RecordLayer {
    cipher: AeadCipher,
    session_key: AeadKey,
    role: Role,
    local_fingerprint: [u8; 32],
    peer_fingerprint: [u8; 32],
    send_counter: u64,
    replay: ReplayWindow,
    replay_window_size: u32,
    messages_since_rekey: u64,
    session_start: Instant,
    rekey_msg_threshold: u64,
    rekey_time_s: u64,
}

impl RecordLayer {
    /// Construct a record layer around a freshly derived session key.
    #[must_use]
    pub fn new(
        session_key: [u8; 32],
        role: Role,
        local_fingerprint: [u8; 32],
        peer_fingerprint: [u8; 32],
        config: &Config,
    ) -> Self {
        let key = AeadKey::new(session_key);
        Self {
            cipher: AeadCipher::new(&key),
            session_key: key,
            role,
            local_fingerprint,
            peer_fingerprint,
            send_counter: 0,
            replay: ReplayWindow::new(config.replay_window),
            replay_window_size: config.replay_window,
            messages_since_rekey: 0,
            session_start: Instant::now(),
            rekey_msg_threshold: config.rekey_msg_threshold,
            rekey_time_s: config.rekey_time_s,
        }
    }

    /// The current session key, for rekey salt derivation.
    #[must_use]
    pub fn session_key_bytes(&self) -> &[u8; 32] {
        self.session_key.as_bytes()
    }

    /// Seal `plaintext` for `msg_type`, advancing the send counter.
    pub fn seal(
        &mut self,
        msg_type: MessageType,
        plaintext: &[u8],
        now_unix: u64,
    ) -> Result<SealOutput, ProtocolError> {
        let counter = self.send_counter;
        let nonce = nonce_for(counter, self.role);
        let timestamp_minute = now_unix / 60;
        let aad = record_aad(msg_type, &self.local_fingerprint, timestamp_minute);

        let ciphertext_and_tag = self
            .cipher
            .seal(&nonce, &aad, plaintext)
            .map_err(|_| ProtocolError::AuthFail)?;

        self.send_counter = self
            .send_counter
            .checked_add(1)
            .ok_or(ProtocolError::BadFrame("send counter exhausted".into()))?;
        self.messages_since_rekey += 1;

        let rekey_due = self.messages_since_rekey >= self.rekey_msg_threshold
            || self.session_start.elapsed().as_secs() >= self.rekey_time_s;

        Ok(SealOutput {
            payload: RecordPayload {
                version: RECORD_VERSION,
                nonce,
                ciphertext_and_tag,
            },
            rekey_due,
        })
    }

    /// Open an inbound record-layer payload, enforcing direction, replay,
    /// and timestamp-window checks before the AEAD tag check itself.
    pub fn open(
        &mut self,
        msg_type: MessageType,
        payload: &RecordPayload,
        now_unix: u64,
    ) -> Result<Vec<u8>, ProtocolError> {
        let counter = u64::from_le_bytes(payload.nonce[0..8].try_into().unwrap());
        let inbound_role_tag = u32::from_le_bytes(payload.nonce[8..12].try_into().unwrap());

        if inbound_role_tag == role_tag(self.role) {
            return Err(ProtocolError::BadFrame(
                "frame nonce carries our own send-direction tag".into(),
            ));
        }

        self.replay.accept(counter)?;

        let now_minute = (now_unix / 60) as i64;
        for delta in -TIMESTAMP_SKEW_MINUTES..=TIMESTAMP_SKEW_MINUTES {
            let candidate_minute = now_minute + delta;
            if candidate_minute < 0 {
                continue;
            }
            let aad = record_aad(msg_type, &self.peer_fingerprint, candidate_minute as u64);
            if let Ok(plaintext) = self.cipher.open(&payload.nonce, &aad, &payload.ciphertext_and_tag) {
                return Ok(plaintext);
            }
        }
        Err(ProtocolError::AuthFail)
    }

    /// Whether a rekey has been scheduled (see [`SealOutput::rekey_due`]) and
    /// is still outstanding.
    #[must_use]
    pub fn replay_window_size(&self) -> u32 {
        self.replay_window_size
    }

    /// Replace the session key after a rekey exchange, resetting both
    /// counters and the replay window (§4.E's rekey behavior).
    pub fn rekey(&mut self, new_session_key: [u8; 32]) {
        let key = AeadKey::new(new_session_key);
        self.cipher = AeadCipher::new(&key);
        self.session_key = key;
        self.send_counter = 0;
        self.replay = ReplayWindow::new(self.replay_window_size);
        self.messages_since_rekey = 0;
        self.session_start = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(cfg: &Config) -> (RecordLayer, RecordLayer) {
        let key = [0x11u8; 32];
        let a_fp = [0xAAu8; 32];
        let b_fp = [0xBBu8; 32];
        let a = RecordLayer::new(key, Role::Initiator, a_fp, b_fp, cfg);
        let b = RecordLayer::new(key, Role::Responder, b_fp, a_fp, cfg);
        (a, b)
    }

    #[test]
    fn seal_then_open_round_trips() {
        let cfg = Config::default();
        let (mut a, mut b) = pair(&cfg);

        let out = a.seal(MessageType::Text, b"hello", 1_700_000_000).unwrap();
        let opened = b.open(MessageType::Text, &out.payload, 1_700_000_000).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let cfg = Config::default();
        let (mut a, mut b) = pair(&cfg);

        let mut out = a.seal(MessageType::Text, b"hello", 1_700_000_000).unwrap();
        let last = out.payload.ciphertext_and_tag.len() - 1;
        out.payload.ciphertext_and_tag[last] ^= 0xFF;

        assert!(matches!(
            b.open(MessageType::Text, &out.payload, 1_700_000_000),
            Err(ProtocolError::AuthFail)
        ));
    }

    #[test]
    fn replayed_frame_is_rejected() {
        let cfg = Config::default();
        let (mut a, mut b) = pair(&cfg);

        let out = a.seal(MessageType::Text, b"hi", 1_700_000_000).unwrap();
        b.open(MessageType::Text, &out.payload, 1_700_000_000).unwrap();
        assert!(matches!(
            b.open(MessageType::Text, &out.payload, 1_700_000_000),
            Err(ProtocolError::Replay)
        ));
    }

    #[test]
    fn out_of_order_within_window_is_accepted() {
        let cfg = Config::default();
        let (mut a, mut b) = pair(&cfg);

        let first = a.seal(MessageType::Text, b"1", 1_700_000_000).unwrap();
        let second = a.seal(MessageType::Text, b"2", 1_700_000_000).unwrap();

        b.open(MessageType::Text, &second.payload, 1_700_000_000).unwrap();
        b.open(MessageType::Text, &first.payload, 1_700_000_000).unwrap();
    }

    #[test]
    fn spoofed_direction_is_rejected() {
        let cfg = Config::default();
        let (mut a, _b) = pair(&cfg);

        // a is Initiator; sealing with a's own layer produces initiator-tagged
        // nonces, which a must never accept as inbound (self-spoof check).
        let out = a.seal(MessageType::Text, b"hi", 1_700_000_000).unwrap();
        assert!(matches!(
            a.open(MessageType::Text, &out.payload, 1_700_000_000),
            Err(ProtocolError::BadFrame(_))
        ));
    }

    #[test]
    fn rekey_invalidates_old_key_for_new_frames_and_vice_versa() {
        let cfg = Config::default();
        let (mut a, mut b) = pair(&cfg);

        let pre_rekey = a.seal(MessageType::Text, b"before", 1_700_000_000).unwrap();

        let new_key = [0x22u8; 32];
        a.rekey(new_key);
        b.rekey(new_key);

        let post_rekey = a.seal(MessageType::Text, b"after", 1_700_000_000).unwrap();

        // Pre-rekey frame was already consumed in counter space the new key
        // doesn't share context with; simulate "old key can't open new frame"
        // and "new key can't open pre-rekey frame" directly.
        let mut stale_b = RecordLayer::new([0x11u8; 32], Role::Responder, [0xBBu8; 32], [0xAAu8; 32], &cfg);
        assert!(stale_b.open(MessageType::Text, &post_rekey.payload, 1_700_000_000).is_err());

        let mut fresh_b_old_key = RecordLayer::new([0x11u8; 32], Role::Responder, [0xBBu8; 32], [0xAAu8; 32], &cfg);
        fresh_b_old_key.open(MessageType::Text, &pre_rekey.payload, 1_700_000_000).unwrap();
        assert!(b.open(MessageType::Text, &pre_rekey.payload, 1_700_000_000).is_err());
    }

    #[test]
    fn replay_window_advances_past_gap() {
        let mut window = ReplayWindow::new(16);
        window.accept(100).unwrap();
        // A counter far beyond window_high + window_size still advances and
        // is accepted (§8 property 3).
        window.accept(200).unwrap();
        assert!(window.accept(150).is_err() || window.accept(199).is_ok());
    }
}
