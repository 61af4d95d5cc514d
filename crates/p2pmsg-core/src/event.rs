//! Typed events delivered to the UI layer (§4.H): one FIFO stream per
//! connection, so a CLI or GUI never polls protocol state directly.

use p2pmsg_crypto::hash::Fingerprint;
use tokio::sync::mpsc;

use crate::frame::MessageType;

/// The bounded capacity of each subscriber's event channel.
///
/// A slow subscriber that never drains its channel eventually causes
/// `publish` to block rather than grow memory without limit — the same
/// backpressure posture as the connection manager's outbound queue.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// One notification surfaced by the core to its caller.
#[derive(Debug, Clone)]
pub enum Event {
    /// A dial attempt to `addr` has started.
    PeerConnecting {
        /// The address being dialed.
        addr: String,
    },
    /// The four-step handshake completed.
    HandshakeComplete {
        /// The peer's identity fingerprint.
        peer_fingerprint: Fingerprint,
        /// Whether this fingerprint had never been seen at this pin context.
        first_contact: bool,
    },
    /// An application message was received and its AEAD tag verified.
    MessageReceived {
        /// `Text`, `File`, or `Heartbeat`.
        kind: MessageType,
        /// The decrypted payload.
        body: Vec<u8>,
        /// Unix timestamp carried in the record-layer AAD.
        timestamp: u64,
    },
    /// An application message was sealed and written to the socket.
    MessageSent {
        /// `Text`, `File`, or `Heartbeat`.
        kind: MessageType,
        /// The number of plaintext bytes sent.
        len: usize,
    },
    /// The peer session ended, gracefully or otherwise.
    PeerDisconnected {
        /// A short, human-readable reason (not a secret, safe to display).
        reason: String,
    },
    /// A recoverable error occurred; the session continues unless `fatal`.
    Error {
        /// A short classification, e.g. `"protocol"`, `"network"`.
        kind: String,
        /// Human-readable detail.
        detail: String,
        /// Whether the connection was torn down as a result.
        fatal: bool,
    },
}

/// A FIFO handle a caller polls or awaits for one connection's events.
pub struct EventSubscriber {
    rx: mpsc::Receiver<Event>,
}

impl EventSubscriber {
    /// Wait for the next event; `None` once the publishing side is dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Drain any events currently buffered without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// The publishing half, held by the connection manager.
///
/// Cloning an `EventBus` shares the same subscriber: every clone's `publish`
/// writes to the one channel created by [`EventBus::new`]. A connection
/// manager typically keeps one `EventBus` per live connection.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<Event>,
}

impl EventBus {
    /// Create a bus and its paired subscriber.
    #[must_use]
    pub fn new() -> (Self, EventSubscriber) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self { tx }, EventSubscriber { rx })
    }

    /// Publish an event, waiting if the subscriber's channel is full.
    ///
    /// Returns `false` if the subscriber has been dropped; callers treat
    /// this as "nobody is listening anymore" rather than an error.
    pub async fn publish(&self, event: Event) -> bool {
        self.tx.send(event).await.is_ok()
    }

    /// Publish without waiting; drops the event if the channel is full.
    ///
    /// Used on hot paths (e.g. per-message `MessageReceived`) where a slow
    /// subscriber must never stall the record-layer read loop.
    pub fn publish_lossy(&self, event: Event) {
        let _ = self.tx.try_send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_events_arrive_in_order() {
        let (bus, mut sub) = EventBus::new();
        bus.publish(Event::PeerConnecting { addr: "127.0.0.1:5555".into() }).await;
        bus.publish(Event::PeerDisconnected { reason: "bye".into() }).await;

        assert!(matches!(sub.recv().await, Some(Event::PeerConnecting { .. })));
        assert!(matches!(sub.recv().await, Some(Event::PeerDisconnected { .. })));
    }

    #[tokio::test]
    async fn dropped_subscriber_makes_publish_return_false() {
        let (bus, sub) = EventBus::new();
        drop(sub);
        let delivered = bus.publish(Event::PeerDisconnected { reason: "bye".into() }).await;
        assert!(!delivered);
    }

    #[test]
    fn lossy_publish_drops_when_full() {
        let (bus, mut sub) = EventBus::new();
        for _ in 0..EVENT_CHANNEL_CAPACITY {
            bus.publish_lossy(Event::PeerDisconnected { reason: "x".into() });
        }
        // One more than capacity: silently dropped, no panic.
        bus.publish_lossy(Event::PeerDisconnected { reason: "overflow".into() });

        let mut drained = 0;
        while sub.try_recv().is_some() {
            drained += 1;
        }
        assert_eq!(drained, EVENT_CHANNEL_CAPACITY);
    }
}
