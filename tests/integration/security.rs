//! Security1 over the broker transport: handshake, dual-topic switch, and
//! encrypted operational traffic.

use crate::*;

use serde_json::json;
use sluice_core::fault::{Category, Component};
use sluice_core::security1::SessionState;
use sluiced::transport::broker::{BrokerCommand, BrokerEvent};

const POP: &str = "garden-42";

/// Run the complete handshake over the handshake topics. Asserts the
/// subscription switch and leaves the session active.
async fn run_handshake(b: &mut Bench) -> Peer {
    let subscribed = broker_connect(b).await;
    assert_eq!(subscribed, "dev/x/handshake/request");

    let mut peer = Peer::new();
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/handshake/request".into(),
            payload: peer.establish_msg(),
        })
        .await
        .unwrap();

    let (topic, reply) = next_publish(&mut b.broker_commands).await;
    assert_eq!(topic, "dev/x/handshake/response");
    assert_eq!(reply.len(), 51);
    let device_public = peer.absorb_reply(&reply, POP);

    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/handshake/request".into(),
            payload: peer.verify_msg(&device_public),
        })
        .await
        .unwrap();

    // Verify reply, then the topic switch, in order.
    let (topic, reply) = next_publish(&mut b.broker_commands).await;
    assert_eq!(topic, "dev/x/handshake/response");
    assert_eq!(reply, [0x01, 0x02, 0x00]);

    assert_eq!(
        next_broker_command(&mut b.broker_commands).await,
        BrokerCommand::Unsubscribe("dev/x/handshake/request".into())
    );
    assert_eq!(
        next_broker_command(&mut b.broker_commands).await,
        BrokerCommand::Subscribe("dev/x/data/request".into())
    );

    // The worker activates the session right after the subscription switch;
    // give it a beat before tests inspect session state directly.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    peer
}

#[tokio::test]
async fn handshake_completes_and_switches_topics() {
    let mut b = bench(security1_config(POP));
    let _peer = run_handshake(&mut b).await;

    let session = b.runtime.session().unwrap();
    assert_eq!(session.lock().await.state(), SessionState::SessionActive);
}

#[tokio::test]
async fn encrypted_command_round_trips() {
    let mut b = bench(security1_config(POP));
    let peer = run_handshake(&mut b).await;

    let command = json!({"id": 77, "op": "wifiScan"});
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/data/request".into(),
            payload: peer.encrypt(&serde_json::to_vec(&command).unwrap()),
        })
        .await
        .unwrap();

    let (topic, wire) = next_publish(&mut b.broker_commands).await;
    assert_eq!(topic, "dev/x/data/response");

    let plaintext = peer.decrypt(&wire);
    let response: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
    assert_eq!(response["id"], 77);
    assert_eq!(response["status"], 0);
    assert_eq!(response["is_final"], true);

    // The payload is a JSON string holding the scan blob.
    let blob = response["payload"].as_str().unwrap();
    let aps: Vec<sluice_services::AccessPoint> = serde_json::from_str(blob).unwrap();
    assert_eq!(aps.len(), 3);
}

#[tokio::test]
async fn legacy_topic_is_dead_in_security1_mode() {
    let mut b = bench(security1_config(POP));
    let _peer = run_handshake(&mut b).await;

    let command = json!({"id": 5, "op": "wifiScan"});
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/cmd".into(),
            payload: serde_json::to_vec(&command).unwrap(),
        })
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(
        b.broker_commands.try_recv().is_err(),
        "plaintext topic must not produce a response"
    );
    let stats = b
        .runtime
        .registry()
        .component_stats(Component::BrokerTransport)
        .unwrap();
    assert!(stats.by_category[&Category::Protocol] >= 1);
}

#[tokio::test]
async fn tampered_ciphertext_produces_no_response() {
    let mut b = bench(security1_config(POP));
    let peer = run_handshake(&mut b).await;

    let command = json!({"id": 6, "op": "wifiScan"});
    let mut wire = peer.encrypt(&serde_json::to_vec(&command).unwrap());
    let last = wire.len() - 1;
    wire[last] ^= 0xff;

    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/data/request".into(),
            payload: wire,
        })
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(b.broker_commands.try_recv().is_err());
    let session = b.runtime.session().unwrap();
    let guard = session.lock().await;
    assert_eq!(guard.stats().mac_failures, 1);
    // A single bad MAC does not tear the session down.
    assert_eq!(guard.state(), SessionState::SessionActive);
}

#[tokio::test]
async fn wrong_pop_fails_verification() {
    let mut b = bench(security1_config(POP));
    let subscribed = broker_connect(&mut b).await;
    assert_eq!(subscribed, "dev/x/handshake/request");

    let mut peer = Peer::new();
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/handshake/request".into(),
            payload: peer.establish_msg(),
        })
        .await
        .unwrap();
    let (_, reply) = next_publish(&mut b.broker_commands).await;
    let device_public = peer.absorb_reply(&reply, "wrong-pop-123");

    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/handshake/request".into(),
            payload: peer.verify_msg(&device_public),
        })
        .await
        .unwrap();

    let (topic, reply) = next_publish(&mut b.broker_commands).await;
    assert_eq!(topic, "dev/x/handshake/response");
    assert_eq!(reply[..2], [0x01, 0x02]);
    assert_ne!(reply[2], 0, "verify must fail with a non-zero status");

    // No topic switch happens after a failed verify.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(b.broker_commands.try_recv().is_err());

    let session = b.runtime.session().unwrap();
    assert_eq!(session.lock().await.state(), SessionState::Error);
}

#[tokio::test]
async fn short_ciphertext_is_rejected_before_decryption() {
    let mut b = bench(security1_config(POP));
    let _peer = run_handshake(&mut b).await;

    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/data/request".into(),
            payload: vec![0u8; 48],
        })
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(b.broker_commands.try_recv().is_err());
    let session = b.runtime.session().unwrap();
    let guard = session.lock().await;
    // The length gate fires before the MAC is ever computed.
    assert_eq!(guard.stats().mac_failures, 0);
    assert_eq!(guard.stats().messages_decrypted, 0);
}

#[tokio::test]
async fn handshake_restarts_after_reconnect() {
    let mut b = bench(security1_config(POP));
    let _peer = run_handshake(&mut b).await;

    b.broker_events
        .send(BrokerEvent::Disconnected)
        .await
        .unwrap();
    // Reconnect fires after the (test-sized) backoff.
    assert_eq!(
        next_broker_command(&mut b.broker_commands).await,
        BrokerCommand::Connect
    );
    b.broker_events.send(BrokerEvent::Connected).await.unwrap();
    assert_eq!(
        next_broker_command(&mut b.broker_commands).await,
        BrokerCommand::Subscribe("dev/x/handshake/request".into())
    );

    // The old session key is gone; a fresh handshake succeeds.
    let session = b.runtime.session().unwrap();
    assert_eq!(session.lock().await.state(), SessionState::TransportReady);

    let mut peer = Peer::new();
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/handshake/request".into(),
            payload: peer.establish_msg(),
        })
        .await
        .unwrap();
    let (_, reply) = next_publish(&mut b.broker_commands).await;
    let device_public = peer.absorb_reply(&reply, POP);
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/handshake/request".into(),
            payload: peer.verify_msg(&device_public),
        })
        .await
        .unwrap();
    let (_, reply) = next_publish(&mut b.broker_commands).await;
    assert_eq!(reply, [0x01, 0x02, 0x00]);
}
