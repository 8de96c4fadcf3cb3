#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end negotiation between independent clients.
//!
//! Each client owns a `PeerKeyExchange` and an outbox; `relay` plays the
//! server, forwarding one message and acknowledging key deliveries.

use std::sync::Arc;

use echoes_core::KeyxConfig;
use echoes_crypto::encoding::{from_base64, to_base64};
use echoes_crypto::{CryptoError, EncryptedMessage, KeyFamily};
use echoes_keyx::{
    EchoKind, EncryptionState, InboundEcho, KeyxError, PeerKeyExchange, ProtocolMessage,
    decode_pubkey,
};
use tokio::sync::mpsc;

struct Client {
    name: &'static str,
    keyx: PeerKeyExchange,
    outbox: mpsc::Receiver<ProtocolMessage>,
}

impl Client {
    fn new(name: &'static str) -> Self {
        Self::with_config(name, KeyxConfig::default())
    }

    fn legacy_only(name: &'static str) -> Self {
        Self::with_config(
            name,
            KeyxConfig {
                key_exchange_supported: false,
                ..KeyxConfig::default()
            },
        )
    }

    fn with_config(name: &'static str, config: KeyxConfig) -> Self {
        let (tx, outbox) = mpsc::channel(32);
        Self {
            name,
            keyx: PeerKeyExchange::new(config, Arc::new(name), tx),
            outbox,
        }
    }

    fn next_outbound(&mut self) -> ProtocolMessage {
        self.outbox.try_recv().unwrap()
    }

    async fn state_of(&self, peer: &Self) -> EncryptionState {
        self.keyx.encryption_state_of(peer.name).await
    }
}

/// Forward the next message `from` sent to `to`, acknowledging key deliveries.
async fn relay(from: &mut Client, to: &Client) -> Option<InboundEcho> {
    let message = from.next_outbound();
    assert_eq!(message.recipient(), to.name);

    let ack = match &message {
        ProtocolMessage::Keyx { to, family, .. } => Some(ProtocolMessage::KeyxSent {
            to: to.clone(),
            family: *family,
        }),
        _ => None,
    };
    let inbound = to.keyx.handle_message(message).await.unwrap();
    if let Some(ack) = ack {
        from.keyx.handle_message(ack).await.unwrap();
    }
    inbound
}

/// Full key-exchange handshake initiated by `a`.
async fn negotiate(a: &mut Client, b: &mut Client) {
    a.keyx
        .send_key(b.name, a.keyx.preferred_family())
        .await
        .unwrap();
    relay(a, b).await;
    b.keyx
        .send_key(a.name, b.keyx.preferred_family())
        .await
        .unwrap();
    relay(b, a).await;
}

async fn echo(from: &mut Client, to: &Client, text: &str) -> String {
    from.keyx.send_echo(to.name, text).await.unwrap();
    let inbound = relay(from, to).await.unwrap();
    assert_eq!(inbound.from, from.name);
    inbound.text
}

#[tokio::test]
async fn key_exchange_reaches_encrypted_on_both_sides() {
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");

    alice
        .keyx
        .send_key("bob", KeyFamily::KeyExchange)
        .await
        .unwrap();
    assert_eq!(alice.state_of(&bob).await, EncryptionState::Unencrypted);

    relay(&mut alice, &bob).await;
    // Bob holds Alice's key but has not sent his own yet
    assert_eq!(bob.state_of(&alice).await, EncryptionState::OneWay);
    assert!(!bob.keyx.has_session_key("alice").await);
    assert_eq!(alice.state_of(&bob).await, EncryptionState::Unencrypted);

    bob.keyx
        .send_key("alice", KeyFamily::KeyExchange)
        .await
        .unwrap();
    assert!(bob.keyx.has_session_key("alice").await);
    assert_eq!(bob.state_of(&alice).await, EncryptionState::OneWay);

    relay(&mut bob, &alice).await;
    assert_eq!(alice.state_of(&bob).await, EncryptionState::Encrypted);
    assert_eq!(bob.state_of(&alice).await, EncryptionState::Encrypted);

    assert_eq!(
        alice.keyx.peer_fingerprint("bob").await,
        bob.keyx.local_fingerprint(KeyFamily::KeyExchange).await
    );
    assert_eq!(
        bob.keyx.peer_fingerprint("alice").await,
        alice.keyx.local_fingerprint(KeyFamily::KeyExchange).await
    );

    assert_eq!(echo(&mut alice, &bob, "hello bob").await, "hello bob");
    assert_eq!(echo(&mut bob, &alice, "hi alice ☃").await, "hi alice ☃");
}

#[tokio::test]
async fn state_events_follow_each_transition() {
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    let mut events = bob.keyx.subscribe();

    negotiate(&mut alice, &mut bob).await;

    let mut states = Vec::new();
    while let Ok(change) = events.try_recv() {
        assert_eq!(change.peer, "alice");
        states.push(change.state);
    }
    assert_eq!(
        states,
        vec![
            EncryptionState::OneWay,
            EncryptionState::OneWay,
            EncryptionState::Encrypted
        ]
    );
}

#[tokio::test]
async fn legacy_fallback_when_peer_lacks_key_exchange() {
    let mut alice = Client::new("alice");
    let mut bob = Client::legacy_only("bob");
    assert_eq!(bob.keyx.preferred_family(), KeyFamily::AsymmetricEncrypt);

    alice
        .keyx
        .send_key("bob", KeyFamily::KeyExchange)
        .await
        .unwrap();
    relay(&mut alice, &bob).await;
    assert_eq!(bob.state_of(&alice).await, EncryptionState::Unencrypted);

    // Bob rejects; Alice falls back and re-sends under the legacy family
    let rejection = bob.next_outbound();
    assert_eq!(
        rejection,
        ProtocolMessage::KeyxUnsupported {
            to: "alice".into(),
            from: "bob".into()
        }
    );
    alice.keyx.handle_message(rejection).await.unwrap();
    assert_eq!(
        alice.keyx.negotiated_family("bob").await,
        Some(KeyFamily::AsymmetricEncrypt)
    );

    relay(&mut alice, &bob).await;
    assert_eq!(bob.state_of(&alice).await, EncryptionState::OneWay);
    assert!(bob.keyx.has_session_key("alice").await);

    bob.keyx
        .send_key("alice", bob.keyx.preferred_family())
        .await
        .unwrap();
    let ProtocolMessage::Keyx {
        wrapped_symmetric_key,
        family,
        ..
    } = bob.outbox.try_recv().unwrap()
    else {
        panic!("expected a keyx message");
    };
    assert_eq!(family, KeyFamily::AsymmetricEncrypt);
    assert!(wrapped_symmetric_key.is_some());

    // Re-send so the relay helper can deliver it
    bob.keyx
        .send_key("alice", KeyFamily::AsymmetricEncrypt)
        .await
        .unwrap();
    relay(&mut bob, &alice).await;

    assert_eq!(alice.state_of(&bob).await, EncryptionState::Encrypted);
    assert_eq!(bob.state_of(&alice).await, EncryptionState::Encrypted);
    assert!(alice.keyx.has_session_key("bob").await);

    assert_eq!(echo(&mut alice, &bob, "legacy hello").await, "legacy hello");
    assert_eq!(echo(&mut bob, &alice, "legacy reply").await, "legacy reply");
}

#[tokio::test]
async fn repeated_key_keeps_the_session_key() {
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    negotiate(&mut alice, &mut bob).await;

    alice
        .keyx
        .send_key("bob", KeyFamily::KeyExchange)
        .await
        .unwrap();
    relay(&mut alice, &bob).await;

    assert_eq!(bob.state_of(&alice).await, EncryptionState::Encrypted);
    assert_eq!(echo(&mut alice, &bob, "still here").await, "still here");
}

#[tokio::test]
async fn turn_off_notifies_peer_and_is_idempotent() {
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    negotiate(&mut alice, &mut bob).await;

    alice.keyx.turn_off("bob", true).await.unwrap();
    assert_eq!(alice.state_of(&bob).await, EncryptionState::Unencrypted);
    relay(&mut alice, &bob).await;
    assert_eq!(bob.state_of(&alice).await, EncryptionState::Unencrypted);

    alice.keyx.turn_off("bob", false).await.unwrap();
    alice.keyx.turn_off("nobody", false).await.unwrap();
    alice.keyx.on_peer_disconnected("nobody").await.unwrap();
    assert!(alice.keyx.active_peers().await.is_empty());

    let err = alice.keyx.send_encrypted("bob", "gone").await.unwrap_err();
    assert!(err.needs_key_exchange());
}

#[tokio::test]
async fn session_end_wipes_every_peer_and_local_key() {
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    let mut carol = Client::new("carol");
    negotiate(&mut alice, &mut bob).await;
    negotiate(&mut alice, &mut carol).await;
    assert_eq!(alice.keyx.active_peers().await, vec!["bob", "carol"]);

    let old_fingerprint = alice.keyx.local_fingerprint(KeyFamily::KeyExchange).await;
    assert!(old_fingerprint.is_some());

    alice.keyx.on_session_ended().await;
    assert_eq!(alice.state_of(&bob).await, EncryptionState::Unencrypted);
    assert_eq!(alice.state_of(&carol).await, EncryptionState::Unencrypted);
    assert!(alice.keyx.active_peers().await.is_empty());
    assert!(
        alice
            .keyx
            .local_fingerprint(KeyFamily::KeyExchange)
            .await
            .is_none()
    );

    // A new session negotiates with a fresh local key
    bob.keyx.turn_off("alice", false).await.unwrap();
    negotiate(&mut alice, &mut bob).await;
    assert_eq!(alice.state_of(&bob).await, EncryptionState::Encrypted);
    assert_ne!(
        alice.keyx.local_fingerprint(KeyFamily::KeyExchange).await,
        old_fingerprint
    );
    assert_eq!(echo(&mut bob, &alice, "welcome back").await, "welcome back");
}

#[tokio::test]
async fn tampered_echo_fails_without_touching_state() {
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    negotiate(&mut alice, &mut bob).await;

    let payload = alice.keyx.send_encrypted("bob", "secret").await.unwrap();
    let EncryptedMessage::Symmetric {
        iv,
        aad,
        ciphertext,
    } = payload
    else {
        panic!("expected a symmetric message");
    };
    let mut bytes = from_base64(&ciphertext).unwrap();
    bytes[0] ^= 0x80;

    let result = bob
        .keyx
        .handle_message(ProtocolMessage::Echo {
            to: "bob".into(),
            from: "alice".into(),
            kind: EchoKind::Encrypted,
            payload: EncryptedMessage::Symmetric {
                iv,
                aad,
                ciphertext: to_base64(&bytes),
            },
        })
        .await;

    assert!(matches!(
        result,
        Err(KeyxError::Crypto(CryptoError::DecryptionFailed(_)))
    ));
    assert_eq!(bob.state_of(&alice).await, EncryptionState::Encrypted);
    assert_eq!(echo(&mut alice, &bob, "after tamper").await, "after tamper");
}

#[tokio::test]
async fn malformed_key_clears_negotiated_peer() {
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    negotiate(&mut alice, &mut bob).await;

    let result = bob
        .keyx
        .handle_message(ProtocolMessage::Keyx {
            to: "bob".into(),
            from: "alice".into(),
            pubkey: "%%% not base64 %%%".into(),
            family: KeyFamily::KeyExchange,
            wrapped_symmetric_key: None,
        })
        .await;

    assert!(matches!(
        result,
        Err(KeyxError::Crypto(CryptoError::InvalidKeyMaterial(_)))
    ));
    assert_eq!(bob.state_of(&alice).await, EncryptionState::Unencrypted);
    assert!(!bob.keyx.has_session_key("alice").await);
}

#[tokio::test]
async fn peers_are_negotiated_independently() {
    let mut alice = Client::new("alice");
    let mut bob = Client::new("bob");
    let carol = Client::new("carol");
    negotiate(&mut alice, &mut bob).await;

    alice
        .keyx
        .send_key("carol", KeyFamily::KeyExchange)
        .await
        .unwrap();
    relay(&mut alice, &carol).await;

    assert_eq!(alice.state_of(&bob).await, EncryptionState::Encrypted);
    assert_eq!(alice.state_of(&carol).await, EncryptionState::Unencrypted);
    assert_eq!(carol.state_of(&alice).await, EncryptionState::OneWay);

    carol.keyx.on_peer_disconnected("alice").await.unwrap();
    assert_eq!(carol.state_of(&alice).await, EncryptionState::Unencrypted);
    assert_eq!(echo(&mut bob, &alice, "unaffected").await, "unaffected");
}

#[tokio::test]
async fn received_key_then_acknowledgement_encrypts() {
    let bob = Client::new("bob");
    let mut peer_engine = echoes_crypto::CryptoEngine::new();
    peer_engine
        .generate_key(KeyFamily::KeyExchange, false)
        .await
        .unwrap();
    peer_engine
        .export_key(KeyFamily::KeyExchange, echoes_crypto::KeyPart::Public)
        .unwrap();
    let pem = peer_engine
        .exported(KeyFamily::KeyExchange)
        .public_pem
        .clone()
        .unwrap();

    assert_eq!(
        bob.keyx.encryption_state_of("alice").await,
        EncryptionState::Unencrypted
    );
    bob.keyx
        .on_key_received("alice", KeyFamily::KeyExchange, &pem, None)
        .await
        .unwrap();
    assert_eq!(
        bob.keyx.encryption_state_of("alice").await,
        EncryptionState::OneWay
    );
    bob.keyx
        .on_key_send_acknowledged("alice", KeyFamily::KeyExchange)
        .await
        .unwrap();
    assert_eq!(
        bob.keyx.encryption_state_of("alice").await,
        EncryptionState::Encrypted
    );
    assert_eq!(
        bob.keyx.peer_fingerprint("alice").await,
        peer_engine.exported(KeyFamily::KeyExchange).fingerprint.clone()
    );
}

/// State a concurrent pair of operations may leave behind: fully cleared or
/// fully imported, never a mix.
async fn assert_consistent(client: &Client, peer: &str) {
    let state = client.keyx.encryption_state_of(peer).await;
    let fingerprint = client.keyx.peer_fingerprint(peer).await;
    let has_key = client.keyx.has_session_key(peer).await;
    match state {
        EncryptionState::Unencrypted => {
            assert!(fingerprint.is_none());
            assert!(!has_key);
            assert!(!client.keyx.active_peers().await.iter().any(|p| p == peer));
        }
        EncryptionState::OneWay => {
            assert!(fingerprint.is_some());
            assert!(has_key);
        }
        EncryptionState::Encrypted => panic!("{peer} never acknowledged our key"),
    }
}

#[tokio::test]
async fn import_and_turn_off_on_one_peer_do_not_interleave() {
    let mut alice = Client::new("alice");
    let bob = Client::new("bob");
    bob.keyx
        .send_key("carol", KeyFamily::KeyExchange)
        .await
        .unwrap();
    alice
        .keyx
        .send_key("bob", KeyFamily::KeyExchange)
        .await
        .unwrap();
    let ProtocolMessage::Keyx { pubkey, .. } = alice.next_outbound() else {
        panic!("expected alice's key");
    };
    let pem = decode_pubkey(&pubkey).unwrap();

    for round in 0..8 {
        let import = bob
            .keyx
            .on_key_received("alice", KeyFamily::KeyExchange, &pem, None);
        let off = bob.keyx.turn_off("alice", false);
        let (imported, turned_off) = if round % 2 == 0 {
            tokio::join!(import, off)
        } else {
            let (off, import) = tokio::join!(off, import);
            (import, off)
        };
        imported.unwrap();
        turned_off.unwrap();
        assert_consistent(&bob, "alice").await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_key_racing_session_end_never_outlives_its_local_key() {
    let (tx, _outbox) = mpsc::channel(32);
    let alice = Arc::new(PeerKeyExchange::new(
        KeyxConfig::default(),
        Arc::new("alice"),
        tx,
    ));
    for _ in 0..8 {
        let sending = tokio::spawn({
            let alice = Arc::clone(&alice);
            async move { alice.send_key("bob", KeyFamily::KeyExchange).await }
        });
        alice.on_session_ended().await;
        let result = sending.await.unwrap();
        assert!(
            matches!(result, Ok(()) | Err(KeyxError::SessionEnded)),
            "unexpected result: {result:?}"
        );

        // A record that survived the wipe was built on a key that survived too
        if alice.negotiated_family("bob").await.is_some() {
            assert!(result.is_ok());
            assert!(
                alice
                    .local_fingerprint(KeyFamily::KeyExchange)
                    .await
                    .is_some()
            );
        }

        alice.on_session_ended().await;
        assert!(alice.active_peers().await.is_empty());
        assert!(
            alice
                .local_fingerprint(KeyFamily::KeyExchange)
                .await
                .is_none()
        );
    }
}
