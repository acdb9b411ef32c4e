//! Chunked transfer across the GATT link, driven end to end.
//!
//! Geometry throughout: MTU 23 → chunk size 20 → 13 payload bytes per
//! chunk, the smallest legal BLE configuration.

use crate::*;

use sluice_core::chunk::{ChunkConfig, ChunkManager, ChunkOutcome};
use sluice_core::fault::{Category, Component};
use sluiced::transport::gatt::GattEvent;

/// The chunk manager a peer with the same MTU would run.
fn peer_chunker() -> ChunkManager {
    ChunkManager::new(ChunkConfig {
        max_chunk_size: 20,
        ..ChunkConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn chunked_command_reassembles_out_of_order_with_duplicate() {
    let mut b = bench(legacy_config());
    gatt_connect(&mut b, 23).await;

    let schedule =
        br#"[{"channel":1,"start_minute":360,"duration_minutes":15,"weekdays":31}]"#;
    let frame = binary_command(0x0505, "syncSchedule", schedule);
    let chunks = peer_chunker().split(&frame).unwrap();
    assert!(chunks.len() >= 3, "need a multi-chunk frame for this test");

    // Deliver everything except chunk 0, in reverse, duplicating chunk 1.
    for chunk in chunks.iter().skip(1).rev() {
        b.gatt_events
            .send(GattEvent::RxWrite(chunk.clone()))
            .await
            .unwrap();
    }
    b.gatt_events
        .send(GattEvent::RxWrite(chunks[1].clone()))
        .await
        .unwrap();
    b.gatt_events
        .send(GattEvent::RxWrite(chunks[0].clone()))
        .await
        .unwrap();

    let bytes = next_notify(&mut b.gatt_commands).await;
    assert_eq!(&bytes[..2], &[0x05, 0x05]);
    assert_eq!(bytes[5], 0, "schedule sync should succeed");
    assert_eq!(b.runtime.schedule().program().len(), 1);

    let stats = b.runtime.gatt_chunk_stats();
    assert_eq!(stats.frames_received, 1);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(stats.active_contexts, 0);
}

#[tokio::test]
async fn chunked_response_reassembles_at_peer() {
    // A single access point keeps the scan blob within the 8-chunk limit
    // at this tiny MTU.
    let mut b = bench_with(legacy_config(), FakeWifi::with_ap_count(1));
    gatt_connect(&mut b, 23).await;

    b.gatt_events
        .send(GattEvent::RxWrite(binary_command(0x0c0c, "wifiScan", b"")))
        .await
        .unwrap();

    let receiver = peer_chunker();
    let frame = loop {
        let bytes = next_notify(&mut b.gatt_commands).await;
        assert!(bytes.len() <= 20, "chunk exceeds the link budget");
        match receiver.accept(&bytes).unwrap() {
            ChunkOutcome::Complete(frame) => break frame,
            ChunkOutcome::Accepted => continue,
            ChunkOutcome::Duplicate => panic!("device sent a duplicate chunk"),
        }
    };

    assert_eq!(&frame[..6], &[0x0c, 0x0c, 0x02, b'o', b'k', 0x00]);
    let aps: Vec<sluice_services::AccessPoint> =
        serde_json::from_slice(&frame[6..]).unwrap();
    assert_eq!(aps.len(), 1);
    assert_eq!(b.runtime.gatt_chunk_stats().frames_sent, 1);
}

#[tokio::test]
async fn oversize_response_is_dropped_with_report() {
    // Three access points blow the 8 × 13 byte ceiling at MTU 23.
    let mut b = bench(legacy_config());
    gatt_connect(&mut b, 23).await;

    b.gatt_events
        .send(GattEvent::RxWrite(binary_command(1, "wifiScan", b"")))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert!(
        b.gatt_commands.try_recv().is_err(),
        "oversize response must not reach the driver"
    );
    let stats = b
        .runtime
        .registry()
        .component_stats(Component::GattTransport)
        .unwrap();
    assert_eq!(stats.by_category[&Category::Validation], 1);
}

#[tokio::test]
async fn interleaved_frames_reassemble_independently() {
    let mut b = bench(legacy_config());
    gatt_connect(&mut b, 23).await;

    let frame_a = binary_command(
        0xaaaa,
        "syncSchedule",
        br#"[{"channel":0,"start_minute":60,"duration_minutes":5,"weekdays":1}]"#,
    );
    let frame_b = binary_command(
        0xbbbb,
        "syncSchedule",
        br#"[{"channel":2,"start_minute":90,"duration_minutes":9,"weekdays":2}]"#,
    );

    let peer = peer_chunker();
    let chunks_a = peer.split(&frame_a).unwrap();
    let chunks_b = peer.split(&frame_b).unwrap();

    // Interleave the two frames chunk by chunk.
    for pair in chunks_a.iter().zip(chunks_b.iter()) {
        b.gatt_events
            .send(GattEvent::RxWrite(pair.0.clone()))
            .await
            .unwrap();
        b.gatt_events
            .send(GattEvent::RxWrite(pair.1.clone()))
            .await
            .unwrap();
    }
    for rest in chunks_a.iter().skip(chunks_b.len()) {
        b.gatt_events
            .send(GattEvent::RxWrite(rest.clone()))
            .await
            .unwrap();
    }
    for rest in chunks_b.iter().skip(chunks_a.len()) {
        b.gatt_events
            .send(GattEvent::RxWrite(rest.clone()))
            .await
            .unwrap();
    }

    // Both commands complete; both responses come back.
    let first = next_notify(&mut b.gatt_commands).await;
    let second = next_notify(&mut b.gatt_commands).await;
    let mut ids = [
        u16::from_le_bytes([first[0], first[1]]),
        u16::from_le_bytes([second[0], second[1]]),
    ];
    ids.sort_unstable();
    assert_eq!(ids, [0xaaaa, 0xbbbb]);
    assert_eq!(b.runtime.gatt_chunk_stats().frames_received, 2);
}
