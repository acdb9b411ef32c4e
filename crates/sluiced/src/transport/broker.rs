//! Transport B — publish/subscribe broker client.
//!
//! The broker library is a collaborator behind a channel pair, like the
//! radio stack. The event worker owns the connection state machine and the
//! topic routing; a separate TX worker publishes responses.
//!
//! With Security1 configured the transport runs the dual-topic scheme:
//! handshake traffic on `<prefix>/handshake/{request,response}` until the
//! peer verifies, then a subscription switch to `<prefix>/data/{request,
//! response}` for encrypted operational traffic. Without Security1 it runs
//! the plaintext legacy pair `<prefix>/cmd` and `<prefix>/resp`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;

use sluice_core::config::BrokerConfig;
use sluice_core::fault::{Category, Component, FaultEvent, FaultRegistry, Severity};
use sluice_core::security1::{decrypted_size, Security1Error, Security1Session, SessionState};
use sluice_core::wire::{decode_command_json, encode_response_json, Origin, ResponseFrame};

use crate::backoff::Backoff;
use crate::queue::CommandSender;
use crate::transport::OneShotTimer;

/// How long a worker waits for the session mutex before giving up.
const SESSION_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

// ── Driver boundary ───────────────────────────────────────────────────────────

/// Events delivered by the broker client library.
#[derive(Debug)]
pub enum BrokerEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
    Failure(i32),
}

/// Commands executed by the broker client library.
#[derive(Debug, PartialEq, Eq)]
pub enum BrokerCommand {
    Connect,
    Subscribe(String),
    Unsubscribe(String),
    Publish { topic: String, payload: Vec<u8> },
    Disconnect,
}

/// Connection lifecycle, including the Security1 sub-states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Down,
    Connecting,
    Up,
    HandshakeInProgress,
    Operational,
    EncryptedComm,
    Error,
}

// ── Topic layout ──────────────────────────────────────────────────────────────

/// Topic names under the configured prefix. Routing compares whole strings —
/// no wildcard or prefix matching.
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn legacy_command(&self) -> String {
        format!("{}/cmd", self.prefix)
    }

    pub fn legacy_response(&self) -> String {
        format!("{}/resp", self.prefix)
    }

    pub fn handshake_request(&self) -> String {
        format!("{}/handshake/request", self.prefix)
    }

    pub fn handshake_response(&self) -> String {
        format!("{}/handshake/response", self.prefix)
    }

    pub fn data_request(&self) -> String {
        format!("{}/data/request", self.prefix)
    }

    pub fn data_response(&self) -> String {
        format!("{}/data/response", self.prefix)
    }
}

// ── Event worker ──────────────────────────────────────────────────────────────

pub struct BrokerTransport {
    config: BrokerConfig,
    topics: Topics,
    state: BrokerState,
    backoff: Backoff,
    /// Present when Security1 is configured; shared with the TX worker.
    session: Option<Arc<Mutex<Security1Session>>>,
    link_up: Arc<AtomicBool>,
    commands: CommandSender,
    driver: mpsc::Sender<BrokerCommand>,
    events: mpsc::Receiver<BrokerEvent>,
    registry: Arc<FaultRegistry>,
    timer: OneShotTimer,
    timer_tx: mpsc::Sender<()>,
    timer_rx: mpsc::Receiver<()>,
    shutdown: broadcast::Receiver<()>,
}

impl BrokerTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BrokerConfig,
        session: Option<Arc<Mutex<Security1Session>>>,
        link_up: Arc<AtomicBool>,
        commands: CommandSender,
        driver: mpsc::Sender<BrokerCommand>,
        events: mpsc::Receiver<BrokerEvent>,
        registry: Arc<FaultRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let topics = Topics::new(&config.topic_prefix);
        let backoff = Backoff::new(
            Duration::from_millis(config.backoff_initial_ms),
            Duration::from_millis(config.backoff_max_ms),
        );
        let (timer_tx, timer_rx) = mpsc::channel(4);
        Self {
            config,
            topics,
            state: BrokerState::Down,
            backoff,
            session,
            link_up,
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

    pub fn state(&self) -> BrokerState {
        self.state
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(uri = %self.config.uri, client_id = %self.config.client_id, "connecting to broker");
        self.send(BrokerCommand::Connect).await;
        self.state = BrokerState::Connecting;

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("broker transport shutting down");
                    self.timer.cancel();
                    self.link_up.store(false, Ordering::Release);
                    self.send(BrokerCommand::Disconnect).await;
                    if let Some(session) = &self.session {
                        if let Ok(mut guard) =
                            timeout(SESSION_LOCK_TIMEOUT, session.lock()).await
                        {
                            guard.stop();
                        }
                    }
                    return Ok(());
                }

                Some(()) = self.timer_rx.recv() => {
                    if matches!(self.state, BrokerState::Down | BrokerState::Error) {
                        self.send(BrokerCommand::Connect).await;
                        self.state = BrokerState::Connecting;
                    }
                }

                event = self.events.recv() => {
                    match event {
                        Some(event) => self.on_event(event).await,
                        None => {
                            tracing::info!("broker driver gone, transport exiting");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn on_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Connected => {
                self.backoff.reset();
                self.timer.cancel();
                self.link_up.store(true, Ordering::Release);

                if self.session.is_some() {
                    self.reset_session().await;
                    self.send(BrokerCommand::Subscribe(self.topics.handshake_request()))
                        .await;
                    self.state = BrokerState::HandshakeInProgress;
                    tracing::info!("broker up, awaiting Security1 handshake");
                } else {
                    self.send(BrokerCommand::Subscribe(self.topics.legacy_command()))
                        .await;
                    self.state = BrokerState::Up;
                    tracing::info!("broker up, legacy topics active");
                }
            }

            BrokerEvent::Disconnected => {
                self.link_up.store(false, Ordering::Release);
                self.state = BrokerState::Down;
                tracing::info!("broker connection lost");
                self.schedule_reconnect();
            }

            BrokerEvent::Failure(code) => {
                self.link_up.store(false, Ordering::Release);
                self.state = BrokerState::Down;
                self.report(
                    Category::Connection,
                    Severity::Error,
                    -1,
                    "broker failure",
                    format!("broker error {code}"),
                );
                self.schedule_reconnect();
            }

            BrokerEvent::Message { topic, payload } => {
                self.route_message(&topic, payload).await;
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        tracing::debug!(delay_ms = delay.as_millis() as u64, "broker reconnect scheduled");
        self.timer.arm(delay, self.timer_tx.clone());
    }

    /// A fresh broker connection restarts the handshake from scratch.
    async fn reset_session(&mut self) {
        let Some(session) = &self.session else { return };
        let Ok(mut guard) = timeout(SESSION_LOCK_TIMEOUT, session.lock()).await else {
            self.report_lock_timeout("session reset");
            return;
        };
        if guard.state() != SessionState::Idle {
            guard.stop();
        }
        // Both transitions are infallible from Idle.
        let _ = guard.start();
        let _ = guard.transport_ready();
    }

    /// Exact-match topic routing.
    async fn route_message(&mut self, topic: &str, payload: Vec<u8>) {
        if self.session.is_some() {
            if topic == self.topics.handshake_request() {
                self.on_handshake_message(&payload).await;
                return;
            }
            if topic == self.topics.data_request() {
                self.on_data_message(&payload).await;
                return;
            }
        } else if topic == self.topics.legacy_command() {
            self.decode_and_enqueue(&payload);
            return;
        }

        self.report(
            Category::Protocol,
            Severity::Warning,
            -2,
            "topic routing",
            format!("message on unexpected topic {topic}"),
        );
    }

    /// Forward a handshake payload to the session verbatim; publish the
    /// reply; on verify success switch to the operational topic pair and
    /// activate the session.
    async fn on_handshake_message(&mut self, payload: &[u8]) {
        let Some(session) = self.session.clone() else { return };

        let (reply, session_state) = {
            let Ok(mut guard) = timeout(SESSION_LOCK_TIMEOUT, session.lock()).await else {
                self.report_lock_timeout("handshake");
                return;
            };
            match guard.handle_handshake(payload) {
                Ok(reply) => (reply, guard.state()),
                Err(e) => {
                    drop(guard);
                    self.report_session_error("handshake", &e);
                    return;
                }
            }
        };

        self.publish(self.topics.handshake_response(), reply).await;

        match session_state {
            SessionState::HandshakeComplete => {
                // Operational topics first, then let traffic flow.
                self.send(BrokerCommand::Unsubscribe(self.topics.handshake_request()))
                    .await;
                self.send(BrokerCommand::Subscribe(self.topics.data_request()))
                    .await;
                self.state = BrokerState::Operational;

                let Ok(mut guard) = timeout(SESSION_LOCK_TIMEOUT, session.lock()).await else {
                    self.report_lock_timeout("session activate");
                    return;
                };
                match guard.activate() {
                    Ok(()) => {
                        self.state = BrokerState::EncryptedComm;
                        tracing::info!("Security1 session active, encrypted topics live");
                    }
                    Err(e) => {
                        drop(guard);
                        self.report_session_error("session activate", &e);
                    }
                }
            }
            SessionState::Error => {
                self.report(
                    Category::Protocol,
                    Severity::Error,
                    -3,
                    "handshake",
                    "handshake rejected, session in error state".into(),
                );
            }
            _ => {}
        }
    }

    /// Decrypt an operational message and enqueue the decoded command.
    async fn on_data_message(&mut self, payload: &[u8]) {
        if self.state != BrokerState::EncryptedComm {
            self.report(
                Category::Protocol,
                Severity::Warning,
                -4,
                "data rx",
                "operational message before session active".into(),
            );
            return;
        }
        if decrypted_size(payload.len()).is_none() {
            self.report(
                Category::Protocol,
                Severity::Warning,
                -5,
                "data rx",
                format!("{} bytes is below the ciphertext minimum", payload.len()),
            );
            return;
        }
        let Some(session) = self.session.clone() else { return };

        let plaintext = {
            let Ok(mut guard) = timeout(SESSION_LOCK_TIMEOUT, session.lock()).await else {
                self.report_lock_timeout("data rx");
                return;
            };
            match guard.decrypt(payload) {
                Ok(pt) => pt,
                Err(e) => {
                    drop(guard);
                    self.report_session_error("data rx", &e);
                    return;
                }
            }
        };

        self.decode_and_enqueue(&plaintext);
    }

    fn decode_and_enqueue(&self, payload: &[u8]) {
        match decode_command_json(payload, Origin::Broker) {
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
                    context: "broker rx decode".into(),
                    description: e.to_string(),
                });
            }
        }
    }

    async fn publish(&self, topic: String, payload: Vec<u8>) {
        self.send(BrokerCommand::Publish { topic, payload }).await;
    }

    async fn send(&self, command: BrokerCommand) {
        if self.driver.send(command).await.is_err() {
            tracing::warn!("broker driver command channel closed");
        }
    }

    fn report_lock_timeout(&self, context: &str) {
        self.registry.report(FaultEvent {
            component: Component::Security1,
            category: Category::Timeout,
            severity: Severity::Error,
            code: -8,
            underlying_code: 0,
            context: context.into(),
            description: "session mutex acquisition timed out".into(),
        });
    }

    fn report_session_error(&self, context: &str, error: &Security1Error) {
        let (category, severity) = match error {
            Security1Error::BadMac => (Category::Protocol, Severity::Error),
            Security1Error::ShortBuffer(_) | Security1Error::InvalidArgument(_) => {
                (Category::Protocol, Severity::Warning)
            }
            Security1Error::InvalidState(_) => (Category::System, Severity::Warning),
            Security1Error::CryptoFailed(_) => (Category::System, Severity::Error),
        };
        self.registry.report(FaultEvent {
            component: Component::Security1,
            category,
            severity,
            code: -9,
            underlying_code: 0,
            context: context.into(),
            description: error.to_string(),
        });
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
            component: Component::BrokerTransport,
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

pub struct BrokerTxWorker {
    topics: Topics,
    responses: mpsc::Receiver<ResponseFrame>,
    driver: mpsc::Sender<BrokerCommand>,
    session: Option<Arc<Mutex<Security1Session>>>,
    link_up: Arc<AtomicBool>,
    registry: Arc<FaultRegistry>,
    shutdown: broadcast::Receiver<()>,
}

impl BrokerTxWorker {
    pub fn new(
        topics: Topics,
        responses: mpsc::Receiver<ResponseFrame>,
        driver: mpsc::Sender<BrokerCommand>,
        session: Option<Arc<Mutex<Security1Session>>>,
        link_up: Arc<AtomicBool>,
        registry: Arc<FaultRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            topics,
            responses,
            driver,
            session,
            link_up,
            registry,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("broker tx worker shutting down");
                    return Ok(());
                }

                response = self.responses.recv() => {
                    match response {
                        Some(response) => self.send_response(response).await,
                        None => {
                            tracing::info!("response queue closed, broker tx exiting");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn send_response(&mut self, response: ResponseFrame) {
        if response.origin != Origin::Broker {
            tracing::debug!(origin = ?response.origin, "foreign-origin response discarded");
            return;
        }
        if !self.link_up.load(Ordering::Acquire) {
            self.report(
                Category::Communication,
                Severity::Warning,
                "link down, response dropped".into(),
            );
            return;
        }

        let json = match encode_response_json(&response) {
            Ok(json) => json,
            Err(e) => {
                self.registry.report(FaultEvent {
                    component: Component::Codec,
                    category: Category::Validation,
                    severity: Severity::Warning,
                    code: -10,
                    underlying_code: 0,
                    context: "broker tx encode".into(),
                    description: e.to_string(),
                });
                return;
            }
        };

        match &self.session {
            Some(session) => {
                let wire = {
                    let Ok(mut guard) = timeout(SESSION_LOCK_TIMEOUT, session.lock()).await
                    else {
                        self.report(
                            Category::Timeout,
                            Severity::Error,
                            "session mutex acquisition timed out".into(),
                        );
                        return;
                    };
                    match guard.encrypt(&json) {
                        Ok(wire) => wire,
                        Err(e) => {
                            drop(guard);
                            self.report(
                                Category::System,
                                Severity::Warning,
                                format!("response dropped: {e}"),
                            );
                            return;
                        }
                    }
                };
                self.publish(self.topics.data_response(), wire).await;
            }
            None => {
                self.publish(self.topics.legacy_response(), json).await;
            }
        }
    }

    async fn publish(&self, topic: String, payload: Vec<u8>) {
        if self
            .driver
            .send(BrokerCommand::Publish { topic, payload })
            .await
            .is_err()
        {
            self.report(
                Category::Communication,
                Severity::Warning,
                "broker driver command channel closed".into(),
            );
        }
    }

    fn report(&self, category: Category, severity: Severity, description: String) {
        self.registry.report(FaultEvent {
            component: Component::BrokerTransport,
            category,
            severity,
            code: -11,
            underlying_code: 0,
            context: "broker tx".into(),
            description,
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
