//! End-to-end command/response flow over both transports.

use crate::*;

use serde_json::json;
use sluice_core::wire::MAX_OP_LEN;
use sluice_services::AccessPoint;
use sluiced::transport::broker::BrokerEvent;
use sluiced::transport::gatt::GattEvent;

#[tokio::test]
async fn wifi_scan_over_gatt() {
    let mut b = bench(legacy_config());
    gatt_connect(&mut b, 512).await;

    b.gatt_events
        .send(GattEvent::RxWrite(binary_command(0x0b0a, "wifiScan", b"")))
        .await
        .unwrap();

    let bytes = next_notify(&mut b.gatt_commands).await;
    // id(LE) ‖ opLen ‖ "ok" ‖ status ‖ payload
    assert_eq!(&bytes[..6], &[0x0a, 0x0b, 0x02, b'o', b'k', 0x00]);

    let aps: Vec<AccessPoint> = serde_json::from_slice(&bytes[6..]).unwrap();
    assert_eq!(aps.len(), 3);
    assert_eq!(aps[0].ssid, "net-0");
}

#[tokio::test]
async fn schedule_sync_over_legacy_broker() {
    let mut b = bench(legacy_config());
    let topic = broker_connect(&mut b).await;
    assert_eq!(topic, "dev/x/cmd");

    let schedule =
        r#"[{"channel":1,"start_minute":360,"duration_minutes":15,"weekdays":31}]"#;
    let command = json!({"id": 9, "op": "syncSchedule", "payload": schedule});
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/cmd".into(),
            payload: serde_json::to_vec(&command).unwrap(),
        })
        .await
        .unwrap();

    let (topic, payload) = next_publish(&mut b.broker_commands).await;
    assert_eq!(topic, "dev/x/resp");
    let response: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(response["id"], 9);
    assert_eq!(response["status"], 0);
    assert_eq!(response["is_final"], true);

    let program = b.runtime.schedule().program();
    assert_eq!(program.len(), 1);
    assert_eq!(program[0].channel, 1);
    assert_eq!(program[0].start_minute, 360);
}

#[tokio::test]
async fn unknown_opcode_gets_minus_one() {
    let mut b = bench(legacy_config());
    broker_connect(&mut b).await;

    let command = json!({"id": 2, "op": "openPod"});
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/cmd".into(),
            payload: serde_json::to_vec(&command).unwrap(),
        })
        .await
        .unwrap();

    let (_, payload) = next_publish(&mut b.broker_commands).await;
    let response: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(response["id"], 2);
    assert_eq!(response["status"], -1);
    assert!(response["payload"].is_null());
}

#[tokio::test]
async fn wifi_configure_over_gatt() {
    let mut b = bench(legacy_config());
    gatt_connect(&mut b, 256).await;

    let creds = br#"{"ssid":"greenhouse","passphrase":"rain-barrel"}"#;
    b.gatt_events
        .send(GattEvent::RxWrite(binary_command(7, "wifiConfigure", creds)))
        .await
        .unwrap();

    let bytes = next_notify(&mut b.gatt_commands).await;
    assert_eq!(bytes[5], 0, "configure should succeed");
    assert_eq!(
        *b.wifi.configured.lock().unwrap(),
        Some(("greenhouse".into(), "rain-barrel".into()))
    );
}

#[tokio::test]
async fn malformed_service_payload_maps_to_negative_status() {
    let mut b = bench(legacy_config());
    let topic = broker_connect(&mut b).await;
    assert_eq!(topic, "dev/x/cmd");

    let command = json!({"id": 3, "op": "syncSchedule", "payload": "nonsense"});
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/cmd".into(),
            payload: serde_json::to_vec(&command).unwrap(),
        })
        .await
        .unwrap();

    let (_, payload) = next_publish(&mut b.broker_commands).await;
    let response: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(response["status"], -2);
}

#[tokio::test]
async fn transports_do_not_cross_responses() {
    let mut b = bench(legacy_config());
    gatt_connect(&mut b, 512).await;
    broker_connect(&mut b).await;

    // One command per transport, same opcode.
    b.gatt_events
        .send(GattEvent::RxWrite(binary_command(100, "wifiScan", b"")))
        .await
        .unwrap();
    let command = json!({"id": 200, "op": "wifiScan"});
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/cmd".into(),
            payload: serde_json::to_vec(&command).unwrap(),
        })
        .await
        .unwrap();

    let bytes = next_notify(&mut b.gatt_commands).await;
    let gatt_id = u16::from_le_bytes([bytes[0], bytes[1]]);
    assert_eq!(gatt_id, 100, "gatt egress must carry the gatt command's id");

    let (topic, payload) = next_publish(&mut b.broker_commands).await;
    assert_eq!(topic, "dev/x/resp");
    let response: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(response["id"], 200);
}

#[tokio::test]
async fn longest_legal_opcode_is_dispatchable() {
    let mut b = bench(legacy_config());
    broker_connect(&mut b).await;

    let op = "x".repeat(MAX_OP_LEN);
    let command = json!({"id": 4, "op": op});
    b.broker_events
        .send(BrokerEvent::Message {
            topic: "dev/x/cmd".into(),
            payload: serde_json::to_vec(&command).unwrap(),
        })
        .await
        .unwrap();

    // Unknown op, but it must round-trip the pipeline rather than being
    // rejected by the codec.
    let (_, payload) = next_publish(&mut b.broker_commands).await;
    let response: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(response["status"], -1);
}
