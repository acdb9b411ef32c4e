//! Fault reporting, reconnection, and eviction behavior under failure.

use crate::*;

use std::time::Duration;

use sluice_core::chunk::{ChunkConfig, ChunkManager};
use sluice_core::fault::{Component, Severity};
use sluiced::transport::broker::{BrokerCommand, BrokerEvent};
use sluiced::transport::gatt::GattEvent;

#[tokio::test]
async fn garbage_gatt_write_is_reported_not_fatal() {
    let mut b = bench(legacy_config());
    gatt_connect(&mut b, 128).await;

    b.gatt_events
        .send(GattEvent::RxWrite(vec![0xde, 0xad]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let registry = b.runtime.registry();
    let stats = registry.component_stats(Component::Codec).unwrap();
    assert_eq!(stats.total_errors, 1);
    assert!(registry.system_health() >= Severity::Warning);

    // The transport keeps working afterwards.
    b.gatt_events
        .send(GattEvent::RxWrite(binary_command(1, "wifiScan", b"")))
        .await
        .unwrap();
    let bytes = next_notify(&mut b.gatt_commands).await;
    assert_eq!(bytes[5], 0);
}

#[tokio::test]
async fn broker_reconnects_and_resubscribes() {
    let mut b = bench(legacy_config());
    let first = broker_connect(&mut b).await;
    assert_eq!(first, "dev/x/cmd");

    b.broker_events
        .send(BrokerEvent::Disconnected)
        .await
        .unwrap();
    assert_eq!(
        next_broker_command(&mut b.broker_commands).await,
        BrokerCommand::Connect
    );

    b.broker_events.send(BrokerEvent::Connected).await.unwrap();
    assert_eq!(
        next_broker_command(&mut b.broker_commands).await,
        BrokerCommand::Subscribe("dev/x/cmd".into())
    );
}

#[tokio::test]
async fn broker_failure_counts_as_connection_fault() {
    let mut b = bench(legacy_config());
    broker_connect(&mut b).await;

    b.broker_events
        .send(BrokerEvent::Failure(-113))
        .await
        .unwrap();
    assert_eq!(
        next_broker_command(&mut b.broker_commands).await,
        BrokerCommand::Connect
    );

    let stats = b
        .runtime
        .registry()
        .component_stats(Component::BrokerTransport)
        .unwrap();
    assert!(stats.total_errors >= 1);
}

#[tokio::test]
async fn stalled_reassembly_is_evicted_by_the_sweep() {
    let mut config = legacy_config();
    config.gatt.chunk.reassembly_timeout_ms = 50;
    let mut b = bench(config);
    gatt_connect(&mut b, 23).await;

    // First chunk of a two-chunk frame; the rest never arrives.
    let frame = binary_command(1, "syncSchedule", &[b'x'; 20]);
    let peer = ChunkManager::new(ChunkConfig {
        max_chunk_size: 20,
        ..ChunkConfig::default()
    })
    .unwrap();
    let chunks = peer.split(&frame).unwrap();
    assert!(chunks.len() >= 2);
    b.gatt_events
        .send(GattEvent::RxWrite(chunks[0].clone()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(b.runtime.gatt_chunk_stats().active_contexts, 1);

    // Wait past the timeout plus a full sweep period.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let stats = b.runtime.gatt_chunk_stats();
    assert_eq!(stats.active_contexts, 0);
    assert!(stats.timeouts >= 1);
}

#[tokio::test]
async fn command_burst_round_trips_without_loss() {
    let mut b = bench(legacy_config());
    gatt_connect(&mut b, 256).await;

    for id in 0..50u16 {
        b.gatt_events
            .send(GattEvent::RxWrite(binary_command(id, "wifiConfigure", b"{}")))
            .await
            .unwrap();
    }

    // Malformed configure payloads — every command still gets exactly one
    // response, in order.
    for id in 0..50u16 {
        let bytes = next_notify(&mut b.gatt_commands).await;
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]), id);
    }
}

#[tokio::test]
async fn clean_shutdown_terminates_all_workers() {
    let b = bench(legacy_config());
    // Must not hang: every worker honors the shutdown broadcast.
    tokio::time::timeout(Duration::from_secs(5), b.runtime.shutdown())
        .await
        .expect("shutdown timed out");
}
