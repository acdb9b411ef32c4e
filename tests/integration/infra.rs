//! Shared test bench: runtime + in-memory drivers + a peer-side Security1
//! implementation written independently of the device code.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use x25519_dalek::{PublicKey, StaticSecret};

use sluice_core::config::SluiceConfig;
use sluice_services::{AccessPoint, SolenoidDriver, WifiDriver};
use sluiced::runtime::Runtime;
use sluiced::transport::broker::{BrokerCommand, BrokerEvent};
use sluiced::transport::gatt::{GattCommand, GattEvent};

pub type Aes256Ctr = Ctr128BE<Aes256>;
pub type HmacSha256 = Hmac<Sha256>;

/// Everything a test needs to drive one device instance.
pub struct Bench {
    pub runtime: Runtime,
    pub gatt_events: mpsc::Sender<GattEvent>,
    pub gatt_commands: mpsc::Receiver<GattCommand>,
    pub broker_events: mpsc::Sender<BrokerEvent>,
    pub broker_commands: mpsc::Receiver<BrokerCommand>,
    pub wifi: Arc<FakeWifi>,
}

/// Wi-Fi driver fake with a fixed scan result.
pub struct FakeWifi {
    pub aps: Vec<AccessPoint>,
    pub configured: Mutex<Option<(String, String)>>,
}

impl FakeWifi {
    pub fn with_ap_count(count: usize) -> Arc<Self> {
        let aps = (0..count)
            .map(|i| AccessPoint {
                ssid: format!("net-{i}"),
                rssi: -40 - i as i8,
                channel: (i % 11) as u8 + 1,
                secure: i % 2 == 0,
            })
            .collect();
        Arc::new(Self {
            aps,
            configured: Mutex::new(None),
        })
    }
}

impl WifiDriver for FakeWifi {
    fn scan(&self) -> anyhow::Result<Vec<AccessPoint>> {
        Ok(self.aps.clone())
    }

    fn configure(&self, ssid: &str, passphrase: &str) -> anyhow::Result<()> {
        *self.configured.lock().unwrap() = Some((ssid.into(), passphrase.into()));
        Ok(())
    }
}

pub struct FakeSolenoid;

impl SolenoidDriver for FakeSolenoid {
    fn set(&self, _channel: u8, _open: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Config with test-sized backoffs and a 23-byte GATT MTU geometry.
pub fn legacy_config() -> SluiceConfig {
    let mut config = SluiceConfig::default();
    config.broker.topic_prefix = "dev/x".into();
    config.broker.backoff_initial_ms = 10;
    config.broker.backoff_max_ms = 80;
    config.gatt.backoff_initial_ms = 10;
    config.gatt.backoff_max_ms = 80;
    config.gatt.inter_chunk_delay_ms = 1;
    config.gatt.chunk.max_chunk_size = 20;
    config
}

pub fn security1_config(pop: &str) -> SluiceConfig {
    let mut config = legacy_config();
    config.security.pop = pop.into();
    config
}

pub fn bench(config: SluiceConfig) -> Bench {
    bench_with(config, FakeWifi::with_ap_count(3))
}

pub fn bench_with(config: SluiceConfig, wifi: Arc<FakeWifi>) -> Bench {
    let (runtime, endpoints) =
        Runtime::start(config, wifi.clone(), Arc::new(FakeSolenoid), 8).unwrap();
    Bench {
        runtime,
        gatt_events: endpoints.gatt_events,
        gatt_commands: endpoints.gatt_commands,
        broker_events: endpoints.broker_events,
        broker_commands: endpoints.broker_commands,
        wifi,
    }
}

// ── Receive helpers ───────────────────────────────────────────────────────────

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn next_gatt_command(rx: &mut mpsc::Receiver<GattCommand>) -> GattCommand {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for gatt command")
        .expect("gatt command channel closed")
}

/// Skip advertising commands until the next notification.
pub async fn next_notify(rx: &mut mpsc::Receiver<GattCommand>) -> Vec<u8> {
    loop {
        if let GattCommand::Notify(bytes) = next_gatt_command(rx).await {
            return bytes;
        }
    }
}

pub async fn next_broker_command(rx: &mut mpsc::Receiver<BrokerCommand>) -> BrokerCommand {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for broker command")
        .expect("broker command channel closed")
}

/// Skip subscription management until the next publish.
pub async fn next_publish(rx: &mut mpsc::Receiver<BrokerCommand>) -> (String, Vec<u8>) {
    loop {
        if let BrokerCommand::Publish { topic, payload } = next_broker_command(rx).await {
            return (topic, payload);
        }
    }
}

/// Drive the GATT link to `Up` with the given MTU.
pub async fn gatt_connect(bench: &mut Bench, mtu: usize) {
    bench.gatt_events.send(GattEvent::Started).await.unwrap();
    match next_gatt_command(&mut bench.gatt_commands).await {
        GattCommand::StartAdvertising(_) => {}
        other => panic!("expected advertising, got {other:?}"),
    }
    bench
        .gatt_events
        .send(GattEvent::Connected { mtu })
        .await
        .unwrap();
    // Let the event worker apply the MTU before tests push traffic.
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// Drive the broker link to connected; returns the first subscribed topic.
pub async fn broker_connect(bench: &mut Bench) -> String {
    match next_broker_command(&mut bench.broker_commands).await {
        BrokerCommand::Connect => {}
        other => panic!("expected connect, got {other:?}"),
    }
    bench.broker_events.send(BrokerEvent::Connected).await.unwrap();
    match next_broker_command(&mut bench.broker_commands).await {
        BrokerCommand::Subscribe(topic) => topic,
        other => panic!("expected subscribe, got {other:?}"),
    }
}

/// Build binary command bytes: `id(2, LE) ‖ opLen(1) ‖ op ‖ payload`.
pub fn binary_command(id: u16, op: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&id.to_le_bytes());
    out.push(op.len() as u8);
    out.extend_from_slice(op.as_bytes());
    out.extend_from_slice(payload);
    out
}

// ── Peer-side Security1 ───────────────────────────────────────────────────────

/// The phone-app side of the handshake, implemented from the wire format
/// alone so interop bugs in the device code cannot cancel out.
pub struct Peer {
    secret: StaticSecret,
    pub public: [u8; 32],
    pub session_key: [u8; 32],
    pub device_random: [u8; 16],
}

impl Peer {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = *PublicKey::from(&secret).as_bytes();
        Self {
            secret,
            public,
            session_key: [0u8; 32],
            device_random: [0u8; 16],
        }
    }

    pub fn establish_msg(&self) -> Vec<u8> {
        let mut msg = vec![0x01, 0x01, 32];
        msg.extend_from_slice(&self.public);
        msg
    }

    /// Parse the establish reply and derive the session key. Returns the
    /// device public key for the verify step.
    pub fn absorb_reply(&mut self, reply: &[u8], pop: &str) -> [u8; 32] {
        assert_eq!(&reply[..3], &[0x01, 0x01, 32]);
        let mut device_public = [0u8; 32];
        device_public.copy_from_slice(&reply[3..35]);
        self.device_random.copy_from_slice(&reply[35..51]);

        let shared = self.secret.diffie_hellman(&PublicKey::from(device_public));
        let pop_hash = Sha256::digest(pop.as_bytes());
        for (out, (a, b)) in self
            .session_key
            .iter_mut()
            .zip(shared.as_bytes().iter().zip(pop_hash.iter()))
        {
            *out = a ^ b;
        }
        device_public
    }

    pub fn verify_msg(&self, device_public: &[u8; 32]) -> Vec<u8> {
        let mut token = *device_public;
        let mut cipher = Aes256Ctr::new(&self.session_key.into(), &self.device_random.into());
        cipher.apply_keystream(&mut token);

        let mut msg = vec![0x01, 0x02];
        msg.extend_from_slice(&32u16.to_be_bytes());
        msg.extend_from_slice(&token);
        msg
    }

    /// Encrypt an operational message: `IV(16) ‖ MAC(32) ‖ ct`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut ct = plaintext.to_vec();
        let mut cipher = Aes256Ctr::new(&self.session_key.into(), &iv.into());
        cipher.apply_keystream(&mut ct);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.session_key).unwrap();
        mac.update(&iv);
        mac.update(&ct);
        let tag = mac.finalize().into_bytes();

        let mut out = iv.to_vec();
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ct);
        out
    }

    /// Verify and decrypt an operational message from the device.
    pub fn decrypt(&self, wire: &[u8]) -> Vec<u8> {
        assert!(wire.len() > 48, "ciphertext too short");
        let (iv, rest) = wire.split_at(16);
        let (tag, ct) = rest.split_at(32);

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.session_key).unwrap();
        mac.update(iv);
        mac.update(ct);
        mac.verify_slice(tag).expect("mac mismatch");

        let iv: [u8; 16] = iv.try_into().unwrap();
        let mut pt = ct.to_vec();
        let mut cipher = Aes256Ctr::new(&self.session_key.into(), &iv.into());
        cipher.apply_keystream(&mut pt);
        pt
    }
}

impl Default for Peer {
    fn default() -> Self {
        Self::new()
    }
}
