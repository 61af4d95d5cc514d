//! The core error taxonomy (§7): network, protocol, resource, and user
//! errors, plus the vault errors surfaced by the crate core delegates to.
//! Kinds, not causes — logs carry these, never secret material.

use thiserror::Error;

/// Root error type returned by the public API (§6).
#[derive(Debug, Error)]
pub enum Error {
    /// Vault initialization/open/rotation failed.
    #[error(transparent)]
    Vault(#[from] p2pmsg_vault::VaultError),

    /// Transport-level failure.
    #[error(transparent)]
    Network(#[from] NetworkError),

    /// Wire protocol or handshake failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A bounded resource was exhausted or already in use.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The caller supplied invalid input.
    #[error(transparent)]
    User(#[from] UserError),

    /// The cryptographic layer failed outside the handshake/record-layer
    /// paths that already classify failures as `Protocol`.
    #[error(transparent)]
    Crypto(#[from] p2pmsg_crypto::CryptoError),

    /// The encrypted message log or attachment store failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Persistence errors from the encrypted message log and attachment store
/// (§4.G, §7 `StorageError`).
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying filesystem or database I/O failure.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// A stored row failed to decode or failed to AEAD-open.
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// The database was busy past its configured timeout.
    #[error("storage busy")]
    Busy,
}

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Failed to bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    BindFailed {
        /// The address that failed to bind.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The peer actively refused the connection.
    #[error("connection refused by {addr}")]
    ConnectRefused {
        /// The address that refused the connection.
        addr: String,
    },

    /// A connect or I/O deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The peer host was unreachable.
    #[error("host unreachable: {addr}")]
    Unreachable {
        /// The address that was unreachable.
        addr: String,
    },

    /// Any other I/O failure on the socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol / handshake / record-layer errors (§4.D, §4.E).
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A frame failed to parse or exceeded `max_frame_bytes`.
    #[error("malformed frame: {0}")]
    BadFrame(String),

    /// A handshake signature failed to verify.
    #[error("bad signature in handshake")]
    BadSignature,

    /// `CHALLENGE_RESPONSE` failed to AEAD-open, or its cleartext was not a
    /// valid signature over the challenge.
    #[error("bad challenge response")]
    BadChallengeResponse,

    /// A peer's presented identity key didn't match the pinned one (TOFU).
    #[error("identity mismatch for pinned peer")]
    IdentityMismatch,

    /// The record layer's `version` byte was not recognized.
    #[error("unknown record layer version: {0}")]
    UnknownVersion(u8),

    /// A frame arrived that was not valid for the current state machine
    /// state.
    #[error("unexpected frame in current state")]
    UnexpectedState,

    /// A receive-counter value was already accepted once (§4.E).
    #[error("replayed frame rejected")]
    Replay,

    /// AEAD authentication failed on an inbound frame.
    #[error("authentication failure")]
    AuthFail,

    /// The handshake did not complete within its deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,

    /// No inbound frame arrived within `3 * heartbeat_interval`.
    #[error("peer unreachable: heartbeat timeout")]
    PeerUnreachable,
}

/// Resource-exhaustion errors.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// A second connection was attempted while one was already active
    /// (§4.F's single-session invariant).
    #[error("a session is already active")]
    Busy,

    /// The bounded outbound queue rejected a non-blocking enqueue.
    #[error("outbound queue is full")]
    QueueFull,
}

/// Caller-supplied input errors.
#[derive(Debug, Error)]
pub enum UserError {
    /// The supplied address could not be parsed or resolved.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The supplied port was out of range or otherwise invalid.
    #[error("invalid port: {0}")]
    InvalidPort(u32),

    /// The attachment exceeds `max_file_bytes`.
    #[error("file too large: {size} bytes exceeds the {max} byte limit")]
    FileTooLarge {
        /// The file's actual size in bytes.
        size: u64,
        /// The configured maximum.
        max: u64,
    },

    /// The attachment's filename was rejected by path sanitization.
    #[error("invalid filename: {0}")]
    InvalidFilename(String),
}

/// Process exit codes for a CLI harness driving the public API (§6).
pub mod exit_code {
    /// Success.
    pub const OK: i32 = 0;
    /// Bad CLI arguments.
    pub const BAD_ARGS: i32 = 2;
    /// Vault errors.
    pub const VAULT: i32 = 10;
    /// Network errors.
    pub const NETWORK: i32 = 20;
    /// Protocol errors.
    pub const PROTOCOL: i32 = 30;
    /// Storage errors.
    pub const STORAGE: i32 = 40;
}

impl Error {
    /// The process exit code a CLI harness should use for this error (§6).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Vault(_) => exit_code::VAULT,
            Error::Network(_) => exit_code::NETWORK,
            Error::Protocol(_) => exit_code::PROTOCOL,
            Error::Resource(_) => exit_code::NETWORK,
            Error::User(_) => exit_code::BAD_ARGS,
            Error::Crypto(_) => exit_code::PROTOCOL,
            Error::Storage(_) => exit_code::STORAGE,
        }
    }
}
