//! Wire protocol codec (§4.C): length-prefixed framing and typed message
//! encode/decode.
//!
//! ```text
//! length(4, big-endian, value <= max_frame_bytes) || type(1) || payload(length-1)
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// The ten wire message types (§4.C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Initiator's first handshake message.
    Hello = 0x01,
    /// Responder's reply to `HELLO`.
    HelloAck = 0x02,
    /// Initiator's signed response to the responder's challenge.
    ChallengeResponse = 0x03,
    /// Responder's confirmation that the session is established.
    Ready = 0x04,
    /// A sealed text message.
    Text = 0x05,
    /// A sealed file attachment.
    File = 0x06,
    /// A zero-byte keepalive.
    Heartbeat = 0x07,
    /// Initiator-of-rekey's fresh ephemeral public key.
    RekeyRequest = 0x08,
    /// Responder-of-rekey's fresh ephemeral public key.
    RekeyAck = 0x09,
    /// Graceful close notice (§SPEC_FULL supplemented behavior #1).
    Bye = 0x0A,
}

impl MessageType {
    /// Frame payloads for these types are record-layer (AEAD) payloads
    /// rather than handshake plaintext.
    #[must_use]
    pub fn is_record_layer(self) -> bool {
        matches!(
            self,
            MessageType::Text
                | MessageType::File
                | MessageType::Heartbeat
                | MessageType::RekeyRequest
                | MessageType::RekeyAck
                | MessageType::Bye
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x03 => Ok(Self::ChallengeResponse),
            0x04 => Ok(Self::Ready),
            0x05 => Ok(Self::Text),
            0x06 => Ok(Self::File),
            0x07 => Ok(Self::Heartbeat),
            0x08 => Ok(Self::RekeyRequest),
            0x09 => Ok(Self::RekeyAck),
            0x0A => Ok(Self::Bye),
            other => Err(ProtocolError::BadFrame(format!("unknown message type 0x{other:02x}"))),
        }
    }
}

/// A decoded frame: its type tag and raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The message type tag.
    pub msg_type: MessageType,
    /// The payload bytes following the type tag.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Construct a frame from a type and payload.
    #[must_use]
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Encode `length || type || payload` into a flat byte buffer.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BadFrame`] if `type(1) + payload` would
    /// exceed `max_frame_bytes`.
    pub fn encode(&self, max_frame_bytes: u32) -> Result<Vec<u8>, ProtocolError> {
        let body_len = 1 + self.payload.len();
        if body_len as u64 > max_frame_bytes as u64 {
            return Err(ProtocolError::BadFrame(format!(
                "frame of {body_len} bytes exceeds max_frame_bytes {max_frame_bytes}"
            )));
        }
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        out.push(self.msg_type as u8);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Read one frame from an async byte stream, enforcing `max_frame_bytes`.
///
/// A length prefix greater than `max_frame_bytes`, or an unrecognized type
/// byte, terminates the connection (the caller propagates the error and
/// tears down the session, per §4.C).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> Result<Frame, ProtocolError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| ProtocolError::BadFrame(format!("length prefix read failed: {e}")))?;
    let len = u32::from_be_bytes(len_buf);

    if len == 0 {
        return Err(ProtocolError::BadFrame("zero-length frame".into()));
    }
    if len > max_frame_bytes {
        return Err(ProtocolError::BadFrame(format!(
            "frame length {len} exceeds max_frame_bytes {max_frame_bytes}"
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ProtocolError::BadFrame(format!("frame body read failed: {e}")))?;

    let msg_type = MessageType::try_from(body[0])?;
    let payload = body[1..].to_vec();
    Ok(Frame::new(msg_type, payload))
}

/// Write one frame to an async byte stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
    max_frame_bytes: u32,
) -> Result<(), ProtocolError> {
    let bytes = frame.encode(max_frame_bytes)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| ProtocolError::BadFrame(format!("frame write failed: {e}")))?;
    Ok(())
}

/// The record-layer payload carried inside `TEXT`/`FILE`/`HEARTBEAT`/
/// `REKEY_*` frames (§4.C): `version(1) || nonce(12) || ciphertext || tag(16)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPayload {
    /// Format version; currently always `0x01`.
    pub version: u8,
    /// The 96-bit AEAD nonce.
    pub nonce: [u8; 12],
    /// `ciphertext || 16-byte tag`, as produced by the AEAD cipher.
    pub ciphertext_and_tag: Vec<u8>,
}

/// The only record-layer payload version this implementation understands.
pub const RECORD_VERSION: u8 = 0x01;

impl RecordPayload {
    /// Encode to bytes for embedding as a frame payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 12 + self.ciphertext_and_tag.len());
        out.push(self.version);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext_and_tag);
        out
    }

    /// Decode from a frame payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < 1 + 12 + 16 {
            return Err(ProtocolError::BadFrame("record payload too short".into()));
        }
        let version = bytes[0];
        if version != RECORD_VERSION {
            return Err(ProtocolError::UnknownVersion(version));
        }
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&bytes[1..13]);
        let ciphertext_and_tag = bytes[13..].to_vec();
        Ok(Self {
            version,
            nonce,
            ciphertext_and_tag,
        })
    }
}

/// Build the AEAD associated data for a record-layer frame (§4.C):
/// `type(1) || sender_fingerprint(32) || timestamp_minute(8)`.
#[must_use]
pub fn record_aad(msg_type: MessageType, sender_fingerprint: &[u8; 32], timestamp_minute: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 32 + 8);
    out.push(msg_type as u8);
    out.extend_from_slice(sender_fingerprint);
    out.extend_from_slice(&timestamp_minute.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_over_a_stream() {
        let frame = Frame::new(MessageType::Text, vec![1, 2, 3, 4, 5]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame, 1024).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor, 1024).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let frame = Frame::new(MessageType::Text, vec![0u8; 100]);
        // Encode under a generous cap, then read back under a tight one.
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame, 1024).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor, 10).await;
        assert!(matches!(result, Err(ProtocolError::BadFrame(_))));
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert!(MessageType::try_from(0xFF).is_err());
    }

    #[test]
    fn record_payload_round_trips() {
        let payload = RecordPayload {
            version: RECORD_VERSION,
            nonce: [7u8; 12],
            ciphertext_and_tag: vec![9u8; 32],
        };
        let bytes = payload.encode();
        let decoded = RecordPayload::decode(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn record_payload_rejects_unknown_version() {
        let mut bytes = RecordPayload {
            version: RECORD_VERSION,
            nonce: [0u8; 12],
            ciphertext_and_tag: vec![0u8; 16],
        }
        .encode();
        bytes[0] = 0x02;
        assert!(matches!(RecordPayload::decode(&bytes), Err(ProtocolError::UnknownVersion(2))));
    }

    #[test]
    fn record_payload_rejects_truncated() {
        assert!(RecordPayload::decode(&[0x01, 0, 0]).is_err());
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_record_payload_round_trips(nonce in proptest::array::uniform12(proptest::num::u8::ANY), ct in proptest::collection::vec(proptest::num::u8::ANY, 16..256)) {
            let payload = RecordPayload { version: RECORD_VERSION, nonce, ciphertext_and_tag: ct };
            let bytes = payload.encode();
            let decoded = RecordPayload::decode(&bytes).unwrap();
            proptest::prop_assert_eq!(decoded, payload);
        }

        #[test]
        fn frame_encode_never_panics_and_respects_cap(payload in proptest::collection::vec(proptest::num::u8::ANY, 0..4096)) {
            let frame = Frame::new(MessageType::Text, payload);
            let _ = frame.encode(4096);
        }
    }
}
