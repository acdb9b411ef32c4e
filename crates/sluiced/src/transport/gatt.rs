//! Transport A — short-range, connection-oriented GATT-style link.
//!
//! The radio stack is a collaborator behind a channel pair: it delivers
//! [`GattEvent`]s and executes [`GattCommand`]s. The event worker owns the
//! connection state machine and the receive path; a separate TX worker
//! drains this transport's response queue.
//!
//! One peer at a time. On connect the negotiated MTU (minus the 3-byte ATT
//! header) becomes the chunk size; on advertising timeouts re-advertising
//! backs off exponentially with jitter, switching from fast to slow
//! advertising parameters once the backoff has grown past baseline.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use sluice_core::chunk::{ChunkError, ChunkHeader, ChunkManager, ChunkOutcome, CHUNK_HEADER_SIZE};
use sluice_core::config::GattConfig;
use sluice_core::fault::{Category, Component, FaultEvent, FaultRegistry, Severity};
use sluice_core::wire::{decode_command, Origin, ResponseFrame};

use crate::backoff::Backoff;
use crate::queue::CommandSender;
use crate::transport::OneShotTimer;

/// ATT notification/write overhead per packet.
pub const ATT_HEADER: usize = 3;

// ── Driver boundary ───────────────────────────────────────────────────────────

/// Events delivered by the radio driver.
#[derive(Debug)]
pub enum GattEvent {
    /// Radio stack initialized; advertising may start.
    Started,
    /// A peer connected and the MTU was negotiated.
    Connected { mtu: usize },
    /// The peer went away.
    Disconnected,
    /// Advertising stopped without a connection.
    AdvertisingComplete,
    /// The peer wrote to the RX attribute.
    RxWrite(Vec<u8>),
    /// Radio-stack error.
    Failure(i32),
}

/// Commands executed by the radio driver.
#[derive(Debug, PartialEq, Eq)]
pub enum GattCommand {
    StartAdvertising(AdvParams),
    /// Notify the TX attribute.
    Notify(Vec<u8>),
}

/// Advertising parameters, adaptive with backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvParams {
    pub device_name: String,
    pub interval_min_ms: u32,
    pub interval_max_ms: u32,
    pub duration_ms: u32,
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattState {
    Down,
    Starting,
    Advertising,
    Up,
    Error,
}

// ── Shared link status ────────────────────────────────────────────────────────

/// Live link facts shared between the event worker and the TX worker.
pub struct LinkStatus {
    up: AtomicBool,
    mtu: AtomicUsize,
}

impl LinkStatus {
    pub fn new(default_mtu: usize) -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(false),
            mtu: AtomicUsize::new(default_mtu),
        })
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Acquire)
    }

    fn set(&self, up: bool, mtu: Option<usize>) {
        if let Some(mtu) = mtu {
            self.mtu.store(mtu, Ordering::Release);
        }
        self.up.store(up, Ordering::Release);
    }
}

// ── Event worker ──────────────────────────────────────────────────────────────

pub struct GattTransport {
    config: GattConfig,
    state: GattState,
    backoff: Backoff,
    chunks: Arc<ChunkManager>,
    link: Arc<LinkStatus>,
    commands: CommandSender,
    driver: mpsc::Sender<GattCommand>,
    events: mpsc::Receiver<GattEvent>,
    registry: Arc<FaultRegistry>,
    timer: OneShotTimer,
    timer_tx: mpsc::Sender<()>,
    timer_rx: mpsc::Receiver<()>,
    shutdown: broadcast::Receiver<()>,
}

impl GattTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GattConfig,
        chunks: Arc<ChunkManager>,
        link: Arc<LinkStatus>,
        commands: CommandSender,
        driver: mpsc::Sender<GattCommand>,
        events: mpsc::Receiver<GattEvent>,
        registry: Arc<FaultRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let backoff = Backoff::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        let (timer_tx, timer_rx) = mpsc::channel(4);
        Self {
            config,
            state: GattState::Down,
            backoff,
            chunks,
            link,
            commands,
            driver,
            events,
            registry,
            timer: OneShotTimer::new(),
            timer_tx,
            timer_rx,
            shutdown,
        }
    }

    pub fn state(&self) -> GattState {
        self.state
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        // Sweep incomplete reassemblies at half their timeout so eviction
        // lands within one extra period of the deadline.
        let reassembly_timeout = self.config.chunk.to_chunk_config().reassembly_timeout;
        let sweep_period = (reassembly_timeout / 2).max(Duration::from_millis(100));
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("gatt transport shutting down");
                    self.timer.cancel();
                    self.link.set(false, None);
                    return Ok(());
                }

                _ = sweep.tick() => {
                    let evicted = self.chunks.sweep_expired();
                    if evicted > 0 {
                        self.report(
                            Category::Timeout,
                            Severity::Warning,
                            -1,
                            "reassembly sweep",
                            format!("{evicted} incomplete frames evicted"),
                        );
                    }
                }

                Some(()) = self.timer_rx.recv() => {
                    if self.state != GattState::Up {
                        self.start_advertising().await;
                    }
                }

                event = self.events.recv() => {
                    match event {
                        Some(event) => self.on_event(event).await,
                        None => {
                            tracing::info!("gatt driver gone, transport exiting");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn on_event(&mut self, event: GattEvent) {
        match event {
            GattEvent::Started => {
                self.state = GattState::Starting;
                self.start_advertising().await;
            }

            GattEvent::Connected { mtu } => {
                self.state = GattState::Up;
                self.backoff.reset();
                self.timer.cancel();
                self.link.set(true, Some(mtu));

                if let Err(e) = self.chunks.set_max_chunk_size(mtu.saturating_sub(ATT_HEADER)) {
                    self.report(
                        Category::Configuration,
                        Severity::Error,
                        -2,
                        "mtu update",
                        e.to_string(),
                    );
                }
                tracing::info!(mtu, "peer connected");
            }

            GattEvent::Disconnected => {
                self.link.set(false, None);
                self.state = GattState::Advertising;
                tracing::info!("peer disconnected, re-advertising");
                // First re-advertise is immediate; backoff only applies to
                // consecutive advertising timeouts.
                self.start_advertising().await;
            }

            GattEvent::AdvertisingComplete => {
                let delay = self.backoff.next_delay();
                tracing::debug!(delay_ms = delay.as_millis() as u64, "advertising timed out");
                self.timer.arm(delay, self.timer_tx.clone());
            }

            GattEvent::RxWrite(bytes) => self.on_rx(&bytes),

            GattEvent::Failure(code) => {
                self.link.set(false, None);
                self.state = GattState::Error;
                self.report(
                    Category::Connection,
                    Severity::Error,
                    -3,
                    "radio failure",
                    format!("radio stack error {code}"),
                );
                let delay = self.backoff.next_delay();
                self.timer.arm(delay, self.timer_tx.clone());
            }
        }
    }

    async fn start_advertising(&mut self) {
        let fast = self.backoff.is_baseline();
        let params = self.adv_params(fast);
        self.state = GattState::Advertising;
        if self.driver.send(GattCommand::StartAdvertising(params)).await.is_err() {
            tracing::warn!("gatt driver command channel closed");
        }
    }

    fn adv_params(&self, fast: bool) -> AdvParams {
        let c = &self.config;
        if fast {
            AdvParams {
                device_name: c.device_name.clone(),
                interval_min_ms: c.adv_fast_interval_min_ms,
                interval_max_ms: c.adv_fast_interval_max_ms,
                duration_ms: c.adv_fast_duration_ms,
            }
        } else {
            AdvParams {
                device_name: c.device_name.clone(),
                interval_min_ms: c.adv_slow_interval_min_ms,
                interval_max_ms: c.adv_slow_interval_max_ms,
                duration_ms: c.adv_slow_duration_ms,
            }
        }
    }

    /// RX attribute write: chunk if it sniffs like one, bare frame otherwise.
    fn on_rx(&self, bytes: &[u8]) {
        let chunk_max = self.link.mtu().saturating_sub(ATT_HEADER);
        if bytes.len() >= CHUNK_HEADER_SIZE {
            if let Some(header) = ChunkHeader::parse(bytes) {
                if header.is_plausible(chunk_max) {
                    self.on_rx_chunk(bytes);
                    return;
                }
            }
        }
        self.decode_and_enqueue(bytes);
    }

    fn on_rx_chunk(&self, bytes: &[u8]) {
        match self.chunks.accept(bytes) {
            Ok(ChunkOutcome::Complete(frame)) => self.decode_and_enqueue(&frame),
            Ok(ChunkOutcome::Accepted) => {}
            Ok(ChunkOutcome::Duplicate) => {
                tracing::debug!("duplicate chunk ignored");
            }
            Err(ChunkError::NoCapacity) => {
                self.report(
                    Category::Resource,
                    Severity::Warning,
                    -4,
                    "chunk rx",
                    "reassembly table full, frame dropped".into(),
                );
            }
            Err(e) => {
                self.report(
                    Category::Protocol,
                    Severity::Warning,
                    -5,
                    "chunk rx",
                    e.to_string(),
                );
            }
        }
    }

    fn decode_and_enqueue(&self, bytes: &[u8]) {
        match decode_command(bytes, Origin::Gatt) {
            Ok(frame) => {
                if !self.commands.offer(frame) {
                    self.report(
                        Category::Resource,
                        Severity::Warning,
                        -6,
                        "command enqueue",
                        "command queue full".into(),
                    );
                }
            }
            Err(e) => {
                self.registry.report(FaultEvent {
                    component: Component::Codec,
                    category: Category::Protocol,
                    severity: Severity::Warning,
                    code: -7,
                    underlying_code: 0,
                    context: "gatt rx decode".into(),
                    description: e.to_string(),
                });
            }
        }
    }

    fn report(
        &self,
        category: Category,
        severity: Severity,
        code: i32,
        context: &str,
        description: String,
    ) {
        self.registry.report(FaultEvent {
            component: Component::GattTransport,
            category,
            severity,
            code,
            underlying_code: 0,
            context: context.into(),
            description,
        });
    }
}

// ── TX worker ─────────────────────────────────────────────────────────────────

pub struct GattTxWorker {
    responses: mpsc::Receiver<ResponseFrame>,
    driver: mpsc::Sender<GattCommand>,
    chunks: Arc<ChunkManager>,
    link: Arc<LinkStatus>,
    registry: Arc<FaultRegistry>,
    inter_chunk_delay: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl GattTxWorker {
    pub fn new(
        responses: mpsc::Receiver<ResponseFrame>,
        driver: mpsc::Sender<GattCommand>,
        chunks: Arc<ChunkManager>,
        link: Arc<LinkStatus>,
        registry: Arc<FaultRegistry>,
        inter_chunk_delay: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            responses,
            driver,
            chunks,
            link,
            registry,
            inter_chunk_delay,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("gatt tx worker shutting down");
                    return Ok(());
                }

                response = self.responses.recv() => {
                    match response {
                        Some(response) => self.send_response(response).await,
                        None => {
                            tracing::info!("response queue closed, gatt tx exiting");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn send_response(&mut self, response: ResponseFrame) {
        if response.origin != Origin::Gatt {
            tracing::debug!(origin = ?response.origin, "foreign-origin response discarded");
            return;
        }
        if !self.link.is_up() {
            self.report_comm("link down, response dropped");
            return;
        }

        let bytes = sluice_core::wire::encode_response(&response);
        let budget = self.link.mtu().saturating_sub(ATT_HEADER);

        if bytes.len() <= budget {
            self.notify(bytes).await;
            return;
        }

        match self.chunks.split(&bytes) {
            Ok(chunks) => {
                let count = chunks.len();
                for (idx, chunk) in chunks.into_iter().enumerate() {
                    self.notify(chunk).await;
                    // Space notifications out so the radio stack's buffers
                    // keep up with a burst of chunks.
                    if idx + 1 < count {
                        tokio::time::sleep(self.inter_chunk_delay).await;
                    }
                }
            }
            Err(e) => {
                self.registry.report(FaultEvent {
                    component: Component::GattTransport,
                    category: Category::Validation,
                    severity: Severity::Warning,
                    code: -8,
                    underlying_code: 0,
                    context: "gatt tx split".into(),
                    description: e.to_string(),
                });
            }
        }
    }

    async fn notify(&self, bytes: Vec<u8>) {
        if self.driver.send(GattCommand::Notify(bytes)).await.is_err() {
            self.report_comm("gatt driver command channel closed");
        }
    }

    fn report_comm(&self, description: &str) {
        self.registry.report(FaultEvent {
            component: Component::GattTransport,
            category: Category::Communication,
            severity: Severity::Warning,
            code: -9,
            underlying_code: 0,
            context: "gatt tx".into(),
            description: description.into(),
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
