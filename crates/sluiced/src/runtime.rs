//! Runtime — the composition root.
//!
//! Owns every shared subsystem (fault registry, chunk manager, Security1
//! session, queues, services) and the worker tasks. Nothing in sluice is a
//! global: tests build as many independent runtimes as they like, each
//! around its own in-memory driver endpoints.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use sluice_core::chunk::{ChunkManager, ChunkStats};
use sluice_core::config::SluiceConfig;
use sluice_core::fault::{Component, FaultRegistry, RecoveryPolicy};
use sluice_core::security1::Security1Session;
use sluice_services::{
    ScheduleStore, SolenoidBank, SolenoidDriver, WifiConfigureService, WifiDriver,
    WifiScanService,
};

use crate::processor::Processor;
use crate::queue::{command_queue, response_router};
use crate::transport::broker::{
    BrokerCommand, BrokerEvent, BrokerTransport, BrokerTxWorker, Topics,
};
use crate::transport::gatt::{
    GattCommand, GattEvent, GattTransport, GattTxWorker, LinkStatus,
};

/// Queue depth for commands and responses.
const FRAME_QUEUE_DEPTH: usize = 64;
/// Queue depth for driver events and commands.
const DRIVER_QUEUE_DEPTH: usize = 64;

/// The channel ends a platform layer (radio stack, broker client) holds.
pub struct DriverEndpoints {
    pub gatt_events: mpsc::Sender<GattEvent>,
    pub gatt_commands: mpsc::Receiver<GattCommand>,
    pub broker_events: mpsc::Sender<BrokerEvent>,
    pub broker_commands: mpsc::Receiver<BrokerCommand>,
}

pub struct Runtime {
    registry: Arc<FaultRegistry>,
    session: Option<Arc<Mutex<Security1Session>>>,
    gatt_chunks: Arc<ChunkManager>,
    gatt_link: Arc<LinkStatus>,
    schedule: Arc<ScheduleStore>,
    bank: Arc<SolenoidBank>,
    shutdown: broadcast::Sender<()>,
    workers: Vec<JoinHandle<anyhow::Result<()>>>,
}

impl Runtime {
    /// Build every subsystem from the config and spawn the workers.
    /// Returns the runtime handle and the driver-side channel endpoints.
    pub fn start(
        config: SluiceConfig,
        wifi_driver: Arc<dyn WifiDriver>,
        solenoid_driver: Arc<dyn SolenoidDriver>,
        valve_channels: usize,
    ) -> anyhow::Result<(Self, DriverEndpoints)> {
        config.validate().context("invalid configuration")?;

        let registry = Arc::new(FaultRegistry::new());
        for component in [
            Component::Codec,
            Component::ChunkManager,
            Component::GattTransport,
            Component::BrokerTransport,
            Component::Security1,
            Component::Processor,
        ] {
            registry.register_component(component, RecoveryPolicy::default(), None);
        }

        let session = config.security.enabled().then(|| {
            Arc::new(Mutex::new(Security1Session::new(&config.security.pop)))
        });

        let gatt_chunks = Arc::new(
            ChunkManager::new(config.gatt.chunk.to_chunk_config())
                .context("invalid chunk configuration")?,
        );
        let gatt_link = LinkStatus::new(config.gatt.chunk.max_chunk_size);
        let broker_up = Arc::new(AtomicBool::new(false));

        // Frame queues.
        let (command_tx, command_rx) = command_queue(FRAME_QUEUE_DEPTH);
        let (responses, gatt_resp_rx, broker_resp_rx) = response_router(FRAME_QUEUE_DEPTH);

        // Driver boundaries.
        let (gatt_event_tx, gatt_event_rx) = mpsc::channel(DRIVER_QUEUE_DEPTH);
        let (gatt_cmd_tx, gatt_cmd_rx) = mpsc::channel(DRIVER_QUEUE_DEPTH);
        let (broker_event_tx, broker_event_rx) = mpsc::channel(DRIVER_QUEUE_DEPTH);
        let (broker_cmd_tx, broker_cmd_rx) = mpsc::channel(DRIVER_QUEUE_DEPTH);

        // Services.
        let bank = Arc::new(SolenoidBank::new(solenoid_driver, valve_channels));
        let schedule = Arc::new(ScheduleStore::new(bank.clone()));

        let (shutdown, _) = broadcast::channel(1);
        let mut workers = Vec::new();

        // Command processor.
        let mut processor = Processor::new(
            command_rx,
            responses,
            registry.clone(),
            shutdown.subscribe(),
        );
        processor.register(schedule.clone());
        processor.register(Arc::new(WifiScanService::new(wifi_driver.clone())));
        processor.register(Arc::new(WifiConfigureService::new(wifi_driver)));
        workers.push(tokio::spawn(processor.run()));

        // Transport A.
        let gatt = GattTransport::new(
            config.gatt.clone(),
            gatt_chunks.clone(),
            gatt_link.clone(),
            command_tx.clone(),
            gatt_cmd_tx.clone(),
            gatt_event_rx,
            registry.clone(),
            shutdown.subscribe(),
        );
        workers.push(tokio::spawn(gatt.run()));

        let gatt_tx = GattTxWorker::new(
            gatt_resp_rx,
            gatt_cmd_tx,
            gatt_chunks.clone(),
            gatt_link.clone(),
            registry.clone(),
            Duration::from_millis(config.gatt.inter_chunk_delay_ms),
            shutdown.subscribe(),
        );
        workers.push(tokio::spawn(gatt_tx.run()));

        // Transport B.
        let topics = Topics::new(&config.broker.topic_prefix);
        let broker = BrokerTransport::new(
            config.broker.clone(),
            session.clone(),
            broker_up.clone(),
            command_tx,
            broker_cmd_tx.clone(),
            broker_event_rx,
            registry.clone(),
            shutdown.subscribe(),
        );
        workers.push(tokio::spawn(broker.run()));

        let broker_tx = BrokerTxWorker::new(
            topics,
            broker_resp_rx,
            broker_cmd_tx,
            session.clone(),
            broker_up,
            registry.clone(),
            shutdown.subscribe(),
        );
        workers.push(tokio::spawn(broker_tx.run()));

        let runtime = Self {
            registry,
            session,
            gatt_chunks,
            gatt_link,
            schedule,
            bank,
            shutdown,
            workers,
        };
        let endpoints = DriverEndpoints {
            gatt_events: gatt_event_tx,
            gatt_commands: gatt_cmd_rx,
            broker_events: broker_event_tx,
            broker_commands: broker_cmd_rx,
        };
        Ok((runtime, endpoints))
    }

    pub fn registry(&self) -> Arc<FaultRegistry> {
        self.registry.clone()
    }

    pub fn session(&self) -> Option<Arc<Mutex<Security1Session>>> {
        self.session.clone()
    }

    pub fn schedule(&self) -> Arc<ScheduleStore> {
        self.schedule.clone()
    }

    pub fn bank(&self) -> Arc<SolenoidBank> {
        self.bank.clone()
    }

    pub fn gatt_chunk_stats(&self) -> ChunkStats {
        self.gatt_chunks.stats()
    }

    pub fn gatt_link_up(&self) -> bool {
        self.gatt_link.is_up()
    }

    /// Stop all workers, close every valve, and wipe session key material.
    pub async fn shutdown(self) {
        tracing::info!("runtime shutting down");
        let _ = self.shutdown.send(());

        for worker in self.workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "worker exited with error"),
                Err(e) => tracing::warn!(error = %e, "worker join failed"),
            }
        }

        self.bank.close_all();
    }
}
