//! The connection manager (§4.F): TCP listener/dialer, per-connection
//! reader/writer/heartbeat tasks, rekey coordination, and backoff reconnect.
//!
//! One [`ConnectionManager`] drives at most one active session at a time
//! (§4.F's single-session invariant). `listen`/`dial` each spawn a
//! supervisor task that runs the handshake, then three cooperating tasks
//! around a session shared between them: a `reader` (owns the socket's read
//! half and all `RecordLayer::open` calls), a `writer` (owns the write half,
//! all `RecordLayer::seal` calls, and the outbound queue), and a
//! `heartbeat` timer. Both reader and writer reach the same
//! `RecordLayer` through one `Arc<Mutex<_>>`, matching §5's "session state is
//! owned by the record layer, accessed through a mutex" model.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use p2pmsg_crypto::hash::Fingerprint;
use p2pmsg_crypto::kdf::hkdf32;
use p2pmsg_crypto::x25519::{PrivateKey as EphemeralPrivateKey, PublicKey as EphemeralPublicKey};
use p2pmsg_vault::Identity;
use rand_core::OsRng;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, NetworkError, ProtocolError, ResourceError};
use crate::event::{Event, EventBus};
use crate::frame::{read_frame, write_frame, Frame, MessageType, RecordPayload};
use crate::handshake::{HandshakeEngine, PeerPinStore, MemoryPinStore, Role};
use crate::record::RecordLayer;
use crate::Config;

const REKEY_INFO: &[u8] = b"p2pmsg v1 rekey";
const OUTBOUND_QUEUE_CAPACITY: usize = 256;

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// A fresh ephemeral keypair generated to rekey the session, plus the old
/// session key it will be mixed with as the HKDF salt (spec §9(ii)).
struct PendingRekey {
    own_eph_sk: EphemeralPrivateKey,
    old_session_key: [u8; 32],
}

/// A job enqueued for the writer task.
enum WriterJob {
    /// Application or control plaintext the writer must seal itself.
    Send(MessageType, Vec<u8>),
    /// A frame already sealed by the reader (a `REKEY_ACK` reply), written
    /// as-is.
    Raw(Frame),
}

/// Which mode the active session was established in, for reconnect policy.
#[derive(Clone)]
enum Mode {
    Listen { port: u16 },
    Dial { addr: String, port: u16 },
}

/// Why a session's reader/writer tasks stopped (§4.E/§4.F/§8 S3).
///
/// Set once, by whichever task first detects the cause, and read back by the
/// session's cleanup task to decide what to publish and whether to
/// reconnect. Distinct from `stop` (which is just "tasks must exit now")
/// because `stop` alone can't tell a local `disconnect()` apart from a
/// transport failure — both end up setting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisconnectReason {
    /// `disconnect()` was called locally.
    LocalClose,
    /// The peer sent a graceful `BYE`.
    Bye,
    /// A record failed to authenticate.
    AuthFail,
    /// No inbound frame within `3 * heartbeat_interval_s`.
    PeerUnreachable,
    /// Any other read/write/framing failure.
    Transport,
}

impl DisconnectReason {
    fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::LocalClose => "LocalClose",
            DisconnectReason::Bye => "Bye",
            DisconnectReason::AuthFail => "AuthFail",
            DisconnectReason::PeerUnreachable => "PeerUnreachable",
            DisconnectReason::Transport => "transport",
        }
    }
}

/// Records `reason` if nothing has claimed the slot yet, then raises `stop`.
async fn request_stop(stop: &Arc<AtomicBool>, close_reason: &Arc<Mutex<Option<DisconnectReason>>>, reason: DisconnectReason) {
    let mut guard = close_reason.lock().await;
    if guard.is_none() {
        *guard = Some(reason);
    }
    drop(guard);
    stop.store(true, Ordering::Relaxed);
}

/// Handle to the currently active session; torn down by `disconnect()` or
/// by the session's cleanup task when the peer goes away.
struct ActiveSession {
    peer_fingerprint: Fingerprint,
    stop: Arc<AtomicBool>,
    close_reason: Arc<Mutex<Option<DisconnectReason>>>,
    outbound: mpsc::Sender<WriterJob>,
}

/// Owns the TCP lifecycle of one peer-to-peer secure channel (§4.F).
///
/// Cloning shares the same single-session slot and event bus; this is the
/// shape the public API hands to a UI/CLI driver, which typically keeps one
/// clone per command handler.
#[derive(Clone)]
pub struct ConnectionManager {
    config: Config,
    identity: Arc<Identity>,
    events: EventBus,
    pins: Arc<Mutex<Box<dyn PeerPinStore>>>,
    session: Arc<Mutex<Option<ActiveSession>>>,
}

impl ConnectionManager {
    /// A manager with the default in-memory TOFU pin store.
    ///
    /// A driver backed by `p2pmsg-store` constructs with
    /// [`ConnectionManager::with_pin_store`] instead, so pinned identities
    /// survive a process restart.
    #[must_use]
    pub fn new(config: Config, identity: Arc<Identity>, events: EventBus) -> Self {
        Self::with_pin_store(config, identity, events, Box::new(MemoryPinStore::default()))
    }

    /// A manager backed by a caller-supplied [`PeerPinStore`].
    #[must_use]
    pub fn with_pin_store(
        config: Config,
        identity: Arc<Identity>,
        events: EventBus,
        pins: Box<dyn PeerPinStore>,
    ) -> Self {
        Self {
            config,
            identity,
            events,
            pins: Arc::new(Mutex::new(pins)),
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// The fingerprint of the currently connected peer, if any.
    pub async fn current_peer(&self) -> Option<Fingerprint> {
        self.session.lock().await.as_ref().map(|s| s.peer_fingerprint)
    }

    async fn reserve_session_slot(&self) -> Result<(), Error> {
        let guard = self.session.lock().await;
        if guard.is_some() {
            return Err(Error::Resource(ResourceError::Busy));
        }
        Ok(())
    }

    /// Bind `0.0.0.0:port` and accept exactly one inbound peer.
    ///
    /// `accept()` loops on a 1 s timeout so a later `disconnect()` is
    /// honoured within a second, per §4.F/§5. A second connection attempt
    /// while a session is active closes the new socket immediately without
    /// disturbing the existing one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resource`] if a session is already active, or
    /// [`Error::Network`] if the listener fails to bind.
    pub async fn listen(&self, port: u16) -> Result<(), Error> {
        self.reserve_session_slot().await?;

        let listener = bind_reuse(port).map_err(|source| {
            Error::Network(NetworkError::BindFailed {
                addr: format!("0.0.0.0:{port}"),
                source,
            })
        })?;
        info!(port, "listening for a peer");

        let this = self.clone();
        let supervisor = tokio::spawn(async move {
            loop {
                let accepted = timeout(Duration::from_secs(1), listener.accept()).await;
                let (stream, peer_addr) = match accepted {
                    Ok(Ok(pair)) => pair,
                    Ok(Err(e)) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                    Err(_) => continue,
                };

                if this.session.lock().await.is_some() {
                    debug!(%peer_addr, "rejecting inbound connection: a session is already active");
                    drop(stream);
                    continue;
                }

                let pin_context = format!("listen:{port}");
                this.events.publish(Event::PeerConnecting { addr: peer_addr.to_string() }).await;
                match this
                    .run_handshake_and_session(stream, Role::Responder, pin_context, Mode::Listen { port })
                    .await
                {
                    Ok(()) => {}
                    Err(e) => warn!(error = %e, "inbound handshake failed"),
                }
                // Only one peer at a time: once a session ends, keep
                // accepting for the next one unless told to stop.
            }
        });

        // The accept loop itself isn't tracked as an ActiveSession — it has
        // no peer fingerprint yet. Each connection that completes the
        // handshake registers the single-session slot itself (`run_session`)
        // and clears it again when that session ends, so the loop keeps
        // accepting the next peer. `disconnect()` stops the *session*;
        // stopping the accept loop permanently isn't part of the public API.
        drop(supervisor);
        Ok(())
    }

    /// Validate `addr:port`, connect with `connect_timeout_s`, then run the
    /// initiator side of the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Resource`] if a session is already active,
    /// [`Error::User`] if `addr` doesn't parse, or [`Error::Network`] for a
    /// refused/timed-out/unreachable connect.
    pub async fn dial(&self, addr: &str, port: u16) -> Result<(), Error> {
        self.reserve_session_slot().await?;

        let target: SocketAddr = format!("{addr}:{port}")
            .parse()
            .map_err(|_| Error::User(crate::error::UserError::InvalidAddress(addr.to_string())))?;

        self.events.publish(Event::PeerConnecting { addr: target.to_string() }).await;
        let stream = connect_with_timeout(target, self.config.connect_timeout_s).await?;

        let pin_context = format!("dial:{addr}:{port}");
        self.run_handshake_and_session(
            stream,
            Role::Initiator,
            pin_context,
            Mode::Dial { addr: addr.to_string(), port },
        )
        .await
    }

    /// Send a `TEXT` message in the active session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] if there is no active session.
    pub async fn send_text(&self, text: &str) -> Result<(), Error> {
        self.enqueue(MessageType::Text, text.as_bytes().to_vec()).await
    }

    /// Send a `FILE` message in the active session.
    ///
    /// The wire payload is `name_len(2, BE) || name || size(8, BE) || bytes`
    /// (a supplement: the spec leaves the exact FILE encoding unspecified
    /// beyond "logical name, byte size").
    ///
    /// # Errors
    ///
    /// Returns [`Error::User`] if `bytes.len()` exceeds `max_file_bytes`, or
    /// [`Error::Network`] if there is no active session.
    pub async fn send_file(&self, name: &str, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() as u64 > self.config.max_file_bytes {
            return Err(Error::User(crate::error::UserError::FileTooLarge {
                size: bytes.len() as u64,
                max: self.config.max_file_bytes,
            }));
        }
        let name_bytes = name.as_bytes();
        if name_bytes.len() > u16::MAX as usize {
            return Err(Error::User(crate::error::UserError::InvalidFilename(name.to_string())));
        }
        let mut payload = Vec::with_capacity(2 + name_bytes.len() + 8 + bytes.len());
        payload.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        payload.extend_from_slice(name_bytes);
        payload.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
        payload.extend_from_slice(bytes);
        self.enqueue(MessageType::File, payload).await
    }

    async fn enqueue(&self, msg_type: MessageType, payload: Vec<u8>) -> Result<(), Error> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or(Error::Network(NetworkError::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no active session",
        ))))?;
        session
            .outbound
            .send(WriterJob::Send(msg_type, payload))
            .await
            .map_err(|_| Error::Network(NetworkError::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer task gone"))))
    }

    /// Record `fingerprint` as verified (out-of-band confirmed), for display
    /// purposes only — verification never changes handshake behavior.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Network`] if there is no active session, or the
    /// fingerprint doesn't match the active peer.
    pub async fn verify_peer(&self, fingerprint: Fingerprint) -> Result<(), Error> {
        let guard = self.session.lock().await;
        match guard.as_ref() {
            Some(session) if session.peer_fingerprint == fingerprint => Ok(()),
            Some(_) => Err(Error::User(crate::error::UserError::InvalidAddress(
                "fingerprint does not match the active peer".into(),
            ))),
            None => Err(Error::Network(NetworkError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no active session",
            )))),
        }
    }

    /// Gracefully close the active session: send `BYE`, then stop the
    /// reader/writer/heartbeat tasks at their next suspension point.
    ///
    /// A no-op if no session is active.
    pub async fn disconnect(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            let _ = session.outbound.send(WriterJob::Send(MessageType::Bye, Vec::new())).await;
            *session.close_reason.lock().await = Some(DisconnectReason::LocalClose);
            session.stop.store(true, Ordering::Relaxed);
            self.events
                .publish(Event::PeerDisconnected { reason: DisconnectReason::LocalClose.as_str().into() })
                .await;
        }
    }

    /// Run the handshake over `stream`, then (on success) spawn the
    /// reader/writer/heartbeat session and register it as the active
    /// session. Returns as soon as the handshake completes and the session
    /// slot is registered — it does not block until the session ends.
    async fn run_handshake_and_session(
        &self,
        stream: TcpStream,
        role: Role,
        pin_context: String,
        mode: Mode,
    ) -> Result<(), Error> {
        let mut engine = HandshakeEngine::new(role, self.identity.clone(), self.config, pin_context);
        let (mut read_half, mut write_half) = stream.into_split();

        let established = timeout(
            Duration::from_secs(self.config.handshake_timeout_s),
            self.drive_handshake(&mut engine, role, &mut read_half, &mut write_half),
        )
        .await
        .map_err(|_| Error::Protocol(ProtocolError::HandshakeTimeout))??;

        info!(
            peer = %established.peer_fingerprint,
            first_contact = established.first_contact,
            "handshake established"
        );
        self.events
            .publish(Event::HandshakeComplete {
                peer_fingerprint: established.peer_fingerprint,
                first_contact: established.first_contact,
            })
            .await;

        self.run_session(read_half, write_half, established.record_layer, established.peer_fingerprint, mode)
            .await;
        Ok(())
    }

    async fn drive_handshake(
        &self,
        engine: &mut HandshakeEngine,
        role: Role,
        read_half: &mut OwnedReadHalf,
        write_half: &mut OwnedWriteHalf,
    ) -> Result<crate::handshake::EstablishedSession, Error> {
        let max_frame_bytes = self.config.max_frame_bytes;

        if role == Role::Initiator {
            let hello = engine.start().map_err(Error::Protocol)?;
            write_frame(write_half, &hello, max_frame_bytes).await.map_err(Error::Protocol)?;
        } else {
            engine.accept().map_err(Error::Protocol)?;
        }

        loop {
            let frame = read_frame(read_half, max_frame_bytes).await.map_err(Error::Protocol)?;
            let mut pins = self.pins.lock().await;
            let step = engine.receive(frame, now_unix(), pins.as_mut()).map_err(Error::Protocol)?;
            drop(pins);

            if let Some(reply) = step.reply {
                write_frame(write_half, &reply, max_frame_bytes).await.map_err(Error::Protocol)?;
            }
            if let Some(established) = step.established {
                return Ok(established);
            }
        }
    }

    /// Spawn the reader/writer/heartbeat tasks for one established session
    /// and register it in the single-session slot. Returns as soon as the
    /// slot is registered — the caller (`dial`/`listen`) does not block on
    /// the session's lifetime. A separate background task awaits the
    /// session's end, clears the slot, publishes `PeerDisconnected` with the
    /// detected cause, and schedules reconnect for `dial` sessions.
    async fn run_session(
        &self,
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        record_layer: RecordLayer,
        peer_fingerprint: Fingerprint,
        mode: Mode,
    ) {
        let record_layer = Arc::new(Mutex::new(record_layer));
        let pending_rekey: Arc<Mutex<Option<PendingRekey>>> = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));
        let close_reason: Arc<Mutex<Option<DisconnectReason>>> = Arc::new(Mutex::new(None));
        let last_inbound = Arc::new(Mutex::new(Instant::now()));
        let last_outbound = Arc::new(Mutex::new(Instant::now()));
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        let local_fingerprint = self.identity.fingerprint();

        let reader = tokio::spawn(reader_task(
            read_half,
            record_layer.clone(),
            pending_rekey.clone(),
            self.config,
            self.events.clone(),
            tx.clone(),
            stop.clone(),
            close_reason.clone(),
            last_inbound.clone(),
            peer_fingerprint,
        ));
        let writer = tokio::spawn(writer_task(
            write_half,
            record_layer.clone(),
            pending_rekey,
            self.config,
            self.events.clone(),
            rx,
            stop.clone(),
            close_reason.clone(),
            last_outbound.clone(),
            local_fingerprint,
        ));
        let heartbeat = tokio::spawn(heartbeat_task(
            self.config,
            tx.clone(),
            stop.clone(),
            close_reason.clone(),
            last_inbound,
            last_outbound,
        ));

        {
            let mut guard = self.session.lock().await;
            *guard = Some(ActiveSession {
                peer_fingerprint,
                stop: stop.clone(),
                close_reason: close_reason.clone(),
                outbound: tx,
            });
        }

        let this = self.clone();
        tokio::spawn(async move {
            let _ = tokio::join!(reader, writer);
            heartbeat.abort();

            let reason = close_reason.lock().await.take().unwrap_or(DisconnectReason::Transport);

            {
                let mut guard = this.session.lock().await;
                if guard.as_ref().is_some_and(|s| s.peer_fingerprint == peer_fingerprint) {
                    *guard = None;
                }
            }

            // `disconnect()` already published `PeerDisconnected{LocalClose}`
            // and cleared the slot itself; don't publish it twice or
            // reconnect after a deliberate local close.
            if reason != DisconnectReason::LocalClose {
                this.events.publish(Event::PeerDisconnected { reason: reason.as_str().into() }).await;
                if let Mode::Dial { addr, port } = mode {
                    this.schedule_reconnect(addr, port);
                }
            }
        });
    }

    fn schedule_reconnect(&self, addr: String, port: u16) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut delay_ms: u64 = 1000;
            for attempt in 1..=this.config.reconnect_max_attempts {
                let jitter = (delay_ms as f64 * 0.2) as u64;
                let sleep_ms = delay_ms.saturating_add(fastrand_jitter(jitter));
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;

                if this.session.lock().await.is_some() {
                    // Another dial/listen already took the slot.
                    return;
                }
                info!(attempt, %addr, port, "reconnect attempt");
                match this.dial(&addr, port).await {
                    Ok(()) => return,
                    Err(e) => warn!(attempt, error = %e, "reconnect attempt failed"),
                }
                delay_ms = (delay_ms * 2).min(30_000);
            }
            warn!(%addr, port, "giving up after reconnect attempts exhausted");
        });
    }
}

/// A small, dependency-free jitter: `±half` around 0, derived from the
/// current instant rather than a CSPRNG (jitter is a scheduling nicety, not
/// a security boundary).
fn fastrand_jitter(half: u64) -> u64 {
    if half == 0 {
        return 0;
    }
    let nanos = Instant::now().elapsed().subsec_nanos() as u64;
    nanos % (2 * half + 1)
}

fn bind_reuse(port: u16) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid socket address");
    let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    {
        // Best-effort only: not every OS supports SO_REUSEPORT, and it is
        // never required for correctness (spec §9(iii)).
        let _ = socket.set_reuse_port(true);
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(16)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

async fn connect_with_timeout(target: SocketAddr, connect_timeout_s: u64) -> Result<TcpStream, Error> {
    match timeout(Duration::from_secs(connect_timeout_s), TcpStream::connect(target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(Error::Network(classify_connect_error(&e, &target))),
        Err(_) => Err(Error::Network(NetworkError::Timeout)),
    }
}

fn classify_connect_error(e: &std::io::Error, target: &SocketAddr) -> NetworkError {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => NetworkError::ConnectRefused { addr: target.to_string() },
        std::io::ErrorKind::TimedOut => NetworkError::Timeout,
        _ => {
            // `ErrorKind::HostUnreachable`/`NetworkUnreachable` are not yet
            // stable; fall back to the platform errno (ENETUNREACH=101,
            // EHOSTUNREACH=113 on Linux).
            match e.raw_os_error() {
                Some(101) | Some(113) => NetworkError::Unreachable { addr: target.to_string() },
                _ => NetworkError::Io(std::io::Error::new(e.kind(), e.to_string())),
            }
        }
    }
}

/// Owns the read half and every `RecordLayer::open` call. Delivers
/// `MessageReceived` for `TEXT`/`FILE`, handles `REKEY_REQUEST`/`REKEY_ACK`
/// in place (§9(ii)'s old-session-key-as-salt rule), and treats inbound
/// `BYE` as a local stop (supplemented behavior #1).
#[allow(clippy::too_many_arguments)]
async fn reader_task(
    mut read_half: OwnedReadHalf,
    record_layer: Arc<Mutex<RecordLayer>>,
    pending_rekey: Arc<Mutex<Option<PendingRekey>>>,
    config: Config,
    events: EventBus,
    outbound: mpsc::Sender<WriterJob>,
    stop: Arc<AtomicBool>,
    close_reason: Arc<Mutex<Option<DisconnectReason>>>,
    last_inbound: Arc<Mutex<Instant>>,
    peer_fingerprint: Fingerprint,
) {
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        let frame = match timeout(Duration::from_secs(1), read_frame(&mut read_half, config.max_frame_bytes)).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => {
                request_stop(&stop, &close_reason, DisconnectReason::Transport).await;
                break;
            }
            Err(_) => continue,
        };

        *last_inbound.lock().await = Instant::now();
        let now = now_unix();

        let Ok(payload) = RecordPayload::decode(&frame.payload) else {
            warn!("malformed record payload");
            request_stop(&stop, &close_reason, DisconnectReason::Transport).await;
            break;
        };

        match frame.msg_type {
            MessageType::Text | MessageType::File => {
                let mut layer = record_layer.lock().await;
                match layer.open(frame.msg_type, &payload, now) {
                    Ok(plaintext) => {
                        drop(layer);
                        events
                            .publish(Event::MessageReceived { kind: frame.msg_type, body: plaintext, timestamp: now })
                            .await;
                    }
                    Err(ProtocolError::Replay) => {
                        drop(layer);
                        warn!(peer = %peer_fingerprint, "replayed frame rejected; session continues");
                        events
                            .publish_lossy(Event::Error { kind: "protocol".into(), detail: "replay".into(), fatal: false });
                    }
                    Err(e) => {
                        drop(layer);
                        warn!(peer = %peer_fingerprint, error = ?e, "authentication failure");
                        events
                            .publish(Event::Error { kind: "protocol".into(), detail: "auth_fail".into(), fatal: true })
                            .await;
                        request_stop(&stop, &close_reason, DisconnectReason::AuthFail).await;
                        break;
                    }
                }
            }
            MessageType::Heartbeat => {
                let mut layer = record_layer.lock().await;
                if layer.open(MessageType::Heartbeat, &payload, now).is_err() {
                    drop(layer);
                    request_stop(&stop, &close_reason, DisconnectReason::AuthFail).await;
                    break;
                }
            }
            MessageType::Bye => {
                let mut layer = record_layer.lock().await;
                let _ = layer.open(MessageType::Bye, &payload, now);
                drop(layer);
                info!(peer = %peer_fingerprint, "peer sent BYE");
                request_stop(&stop, &close_reason, DisconnectReason::Bye).await;
                break;
            }
            MessageType::RekeyRequest => {
                if handle_rekey_request(&record_layer, &payload, now, &outbound).await.is_err() {
                    request_stop(&stop, &close_reason, DisconnectReason::Transport).await;
                    break;
                }
            }
            MessageType::RekeyAck => {
                if handle_rekey_ack(&record_layer, &pending_rekey, &payload, now).await.is_err() {
                    request_stop(&stop, &close_reason, DisconnectReason::Transport).await;
                    break;
                }
            }
            MessageType::Hello | MessageType::HelloAck | MessageType::ChallengeResponse | MessageType::Ready => {
                warn!("unexpected handshake frame after Established");
                request_stop(&stop, &close_reason, DisconnectReason::Transport).await;
                break;
            }
        }
    }
}

/// Responder side of a rekey: open the peer's fresh ephemeral key, derive
/// the new session key, reply with our own fresh ephemeral key sealed under
/// the *old* key (the peer hasn't switched yet), then switch — all under one
/// held lock so no frame can be sealed/opened against a half-switched layer.
async fn handle_rekey_request(
    record_layer: &Arc<Mutex<RecordLayer>>,
    payload: &RecordPayload,
    now: u64,
    outbound: &mpsc::Sender<WriterJob>,
) -> Result<(), ProtocolError> {
    let mut layer = record_layer.lock().await;
    let peer_eph_bytes = layer.open(MessageType::RekeyRequest, payload, now)?;
    if peer_eph_bytes.len() != 32 {
        return Err(ProtocolError::BadFrame("rekey request payload must be 32 bytes".into()));
    }
    let peer_eph_pk = EphemeralPublicKey::from_bytes(peer_eph_bytes.try_into().unwrap());

    let own_eph_sk = EphemeralPrivateKey::generate(&mut OsRng);
    let own_eph_pk = own_eph_sk.public_key();
    let shared = own_eph_sk
        .exchange(&peer_eph_pk)
        .ok_or_else(|| ProtocolError::BadFrame("low-order ephemeral public key in rekey request".into()))?;
    let old_session_key = *layer.session_key_bytes();
    let new_key = hkdf32(shared.as_bytes(), &old_session_key, REKEY_INFO)
        .map_err(|_| ProtocolError::BadFrame("rekey key derivation failed".into()))?;

    let sealed = layer.seal(MessageType::RekeyAck, own_eph_pk.as_bytes(), now)?.payload;
    layer.rekey(new_key);
    drop(layer);

    let _ = outbound.send(WriterJob::Raw(Frame::new(MessageType::RekeyAck, sealed.encode()))).await;
    debug!("responder completed rekey");
    Ok(())
}

/// Initiator side of a rekey: open the peer's `REKEY_ACK` under the old
/// key, finish the same derivation with our own previously-generated
/// ephemeral key, and switch.
async fn handle_rekey_ack(
    record_layer: &Arc<Mutex<RecordLayer>>,
    pending_rekey: &Arc<Mutex<Option<PendingRekey>>>,
    payload: &RecordPayload,
    now: u64,
) -> Result<(), ProtocolError> {
    let pending = pending_rekey.lock().await.take().ok_or(ProtocolError::UnexpectedState)?;

    let mut layer = record_layer.lock().await;
    let peer_eph_bytes = layer.open(MessageType::RekeyAck, payload, now)?;
    if peer_eph_bytes.len() != 32 {
        return Err(ProtocolError::BadFrame("rekey ack payload must be 32 bytes".into()));
    }
    let peer_eph_pk = EphemeralPublicKey::from_bytes(peer_eph_bytes.try_into().unwrap());
    let shared = pending
        .own_eph_sk
        .exchange(&peer_eph_pk)
        .ok_or_else(|| ProtocolError::BadFrame("low-order ephemeral public key in rekey ack".into()))?;
    let new_key = hkdf32(shared.as_bytes(), &pending.old_session_key, REKEY_INFO)
        .map_err(|_| ProtocolError::BadFrame("rekey key derivation failed".into()))?;
    layer.rekey(new_key);
    debug!("initiator completed rekey");
    Ok(())
}

/// Owns the write half, the outbound queue, and every `RecordLayer::seal`
/// call. Initiates a rekey (§4.E) the first time a seal reports
/// `rekey_due` with none already pending.
#[allow(clippy::too_many_arguments)]
async fn writer_task(
    mut write_half: OwnedWriteHalf,
    record_layer: Arc<Mutex<RecordLayer>>,
    pending_rekey: Arc<Mutex<Option<PendingRekey>>>,
    config: Config,
    events: EventBus,
    mut rx: mpsc::Receiver<WriterJob>,
    stop: Arc<AtomicBool>,
    close_reason: Arc<Mutex<Option<DisconnectReason>>>,
    last_outbound: Arc<Mutex<Instant>>,
    local_fingerprint: Fingerprint,
) {
    let _ = local_fingerprint;
    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }

        // Hold back further writes while a rekey we started is still
        // awaiting its REKEY_ACK: the peer's responder switches to the new
        // key as soon as it replies, so anything we queue before our own
        // switch (driven by the ack, on the reader task) must wait or it
        // risks being sealed under the key the peer has already retired.
        while pending_rekey.lock().await.is_some() {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let job = match timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => continue,
        };

        let now = now_unix();
        let frame = match job {
            WriterJob::Send(msg_type, plaintext) => {
                let mut layer = record_layer.lock().await;
                let sealed = match layer.seal(msg_type, &plaintext, now) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        warn!(error = ?e, "seal failed");
                        request_stop(&stop, &close_reason, DisconnectReason::Transport).await;
                        break;
                    }
                };
                let rekey_due = sealed.rekey_due;
                drop(layer);

                let frame = Frame::new(msg_type, sealed.payload.encode());
                if write_frame(&mut write_half, &frame, config.max_frame_bytes).await.is_err() {
                    request_stop(&stop, &close_reason, DisconnectReason::Transport).await;
                    break;
                }
                *last_outbound.lock().await = Instant::now();

                match msg_type {
                    MessageType::Text | MessageType::File => {
                        events.publish(Event::MessageSent { kind: msg_type, len: plaintext.len() }).await;
                    }
                    _ => {}
                }

                if rekey_due && msg_type.is_record_layer() {
                    let mut pending_guard = pending_rekey.lock().await;
                    if pending_guard.is_none() {
                        if let Err(e) = initiate_rekey(&record_layer, &mut pending_guard, now, &mut write_half, config).await {
                            warn!(error = ?e, "failed to initiate rekey");
                        }
                    }
                }
                continue;
            }
            WriterJob::Raw(frame) => frame,
        };

        if write_frame(&mut write_half, &frame, config.max_frame_bytes).await.is_err() {
            request_stop(&stop, &close_reason, DisconnectReason::Transport).await;
            break;
        }
        *last_outbound.lock().await = Instant::now();
    }
}

async fn initiate_rekey(
    record_layer: &Arc<Mutex<RecordLayer>>,
    pending_guard: &mut Option<PendingRekey>,
    now: u64,
    write_half: &mut OwnedWriteHalf,
    config: Config,
) -> Result<(), ProtocolError> {
    let own_eph_sk = EphemeralPrivateKey::generate(&mut OsRng);
    let own_eph_pk = own_eph_sk.public_key();

    let mut layer = record_layer.lock().await;
    let old_session_key = *layer.session_key_bytes();
    let sealed = layer.seal(MessageType::RekeyRequest, own_eph_pk.as_bytes(), now)?.payload;
    drop(layer);

    *pending_guard = Some(PendingRekey { own_eph_sk, old_session_key });

    let frame = Frame::new(MessageType::RekeyRequest, sealed.encode());
    write_frame(write_half, &frame, config.max_frame_bytes)
        .await
        .map_err(|_| ProtocolError::BadFrame("failed to write rekey request".into()))?;
    debug!("initiator started rekey");
    Ok(())
}

/// Sends `HEARTBEAT` after `heartbeat_interval_s` of outbound silence, and
/// raises `PeerUnreachable` after `3 * heartbeat_interval_s` of inbound
/// silence (§4.E "Heartbeat").
async fn heartbeat_task(
    config: Config,
    outbound: mpsc::Sender<WriterJob>,
    stop: Arc<AtomicBool>,
    close_reason: Arc<Mutex<Option<DisconnectReason>>>,
    last_inbound: Arc<Mutex<Instant>>,
    last_outbound: Arc<Mutex<Instant>>,
) {
    let interval = Duration::from_secs(config.heartbeat_interval_s);
    let unreachable_after = interval * 3;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        ticker.tick().await;
        if stop.load(Ordering::Relaxed) {
            break;
        }

        if last_inbound.lock().await.elapsed() >= unreachable_after {
            warn!("no inbound frame within 3x the heartbeat interval");
            request_stop(&stop, &close_reason, DisconnectReason::PeerUnreachable).await;
            break;
        }

        if last_outbound.lock().await.elapsed() >= interval {
            if outbound.send(WriterJob::Send(MessageType::Heartbeat, Vec::new())).await.is_err() {
                break;
            }
        }
    }
}
