//! End-to-end scenarios (spec.md §8) driven over a live loopback TCP pair,
//! through the public [`ConnectionManager`] API rather than the handshake
//! engine or record layer directly.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use p2pmsg_core::{Config, ConnectionManager, Event, EventBus, EventSubscriber};
use p2pmsg_crypto::signatures::SigningKey;
use p2pmsg_crypto::x25519::PrivateKey as ExchangePrivateKey;
use p2pmsg_vault::Identity;
use rand_core::OsRng;

static NEXT_PORT: AtomicU16 = AtomicU16::new(24_900);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::Relaxed)
}

fn identity() -> Arc<Identity> {
    Arc::new(Identity::new(
        SigningKey::generate(&mut OsRng),
        ExchangePrivateKey::generate(&mut OsRng),
        1_700_000_000,
    ))
}

async fn wait_for(sub: &mut EventSubscriber, mut pred: impl FnMut(&Event) -> bool) -> Event {
    for _ in 0..40 {
        if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(250), sub.recv()).await {
            if pred(&event) {
                return event;
            }
        }
    }
    panic!("expected event never arrived");
}

/// S4 — Identity pinning. A new identity dialing a listener that has
/// already pinned a different peer for that context must be rejected
/// before any session is established, and must not disturb listener state.
#[tokio::test]
async fn identity_pinning_rejects_a_different_identity_on_the_same_listener() {
    let port = next_port();
    let (a_events, mut a_sub) = EventBus::new();
    let a = ConnectionManager::new(Config::default(), identity(), a_events);

    let a_listen = a.clone();
    tokio::spawn(async move {
        a_listen.listen(port).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (b1_events, mut b1_sub) = EventBus::new();
    let b1 = ConnectionManager::new(Config::default(), identity(), b1_events);
    b1.dial("127.0.0.1", port).await.unwrap();

    wait_for(&mut a_sub, |e| matches!(e, Event::HandshakeComplete { .. })).await;
    wait_for(&mut b1_sub, |e| matches!(e, Event::HandshakeComplete { .. })).await;

    a.disconnect().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(a.current_peer().await.is_none());

    let (b2_events, _b2_sub) = EventBus::new();
    let b2 = ConnectionManager::new(Config::default(), identity(), b2_events);
    let result = b2.dial("127.0.0.1", port).await;

    assert!(
        result.is_err(),
        "a different identity must not complete the handshake against a context pinned to someone else"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        a.current_peer().await.is_none(),
        "no session may be established for the rejected identity"
    );
}

/// S5 — Rekey triggered by message count. With a low
/// `rekey_msg_threshold`, exchanging enough messages to cross it must
/// trigger exactly one rekey and still deliver every message in order.
#[tokio::test]
async fn rekey_triggers_on_message_count_and_all_messages_survive() {
    let port = next_port();
    let mut config = Config::default();
    config.rekey_msg_threshold = 3;

    let (a_events, mut a_sub) = EventBus::new();
    let (b_events, mut b_sub) = EventBus::new();
    let a = ConnectionManager::new(config, identity(), a_events);
    let b = ConnectionManager::new(config, identity(), b_events);

    let a_listen = a.clone();
    tokio::spawn(async move {
        a_listen.listen(port).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    b.dial("127.0.0.1", port).await.unwrap();

    wait_for(&mut a_sub, |e| matches!(e, Event::HandshakeComplete { .. })).await;
    wait_for(&mut b_sub, |e| matches!(e, Event::HandshakeComplete { .. })).await;

    let messages: Vec<String> = (0..4).map(|i| format!("msg-{i}")).collect();
    for m in &messages {
        b.send_text(m).await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < messages.len() {
        if let Event::MessageReceived { body, .. } =
            wait_for(&mut a_sub, |e| matches!(e, Event::MessageReceived { .. })).await
        {
            received.push(String::from_utf8(body).unwrap());
        }
    }

    assert_eq!(received, messages, "messages must arrive in send order across a rekey");

    // A second round keeps working on the rekeyed session.
    b.send_text("after-rekey").await.unwrap();
    let event = wait_for(&mut a_sub, |e| matches!(e, Event::MessageReceived { .. })).await;
    match event {
        Event::MessageReceived { body, .. } => assert_eq!(body, b"after-rekey"),
        _ => unreachable!(),
    }
}
