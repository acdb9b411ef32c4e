//! Command processor — dequeues commands, dispatches on opcode, and emits
//! exactly one final response per command.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use sluice_core::fault::{Category, Component, FaultEvent, FaultRegistry, Severity};
use sluice_core::wire::{CommandFrame, ResponseFrame};
use sluice_services::CommandService;

use crate::queue::ResponseRouter;

/// Status returned for an opcode no service claims.
pub const STATUS_UNKNOWN_OP: i8 = -1;

pub struct Processor {
    services: HashMap<&'static str, Arc<dyn CommandService>>,
    command_rx: mpsc::Receiver<CommandFrame>,
    responses: ResponseRouter,
    registry: Arc<FaultRegistry>,
    shutdown: broadcast::Receiver<()>,
}

impl Processor {
    pub fn new(
        command_rx: mpsc::Receiver<CommandFrame>,
        responses: ResponseRouter,
        registry: Arc<FaultRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            services: HashMap::new(),
            command_rx,
            responses,
            registry,
            shutdown,
        }
    }

    /// Register a service under its opcode. Last registration wins.
    pub fn register(&mut self, service: Arc<dyn CommandService>) {
        self.services.insert(service.op(), service);
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("command processor shutting down");
                    return Ok(());
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            tracing::info!("command queue closed, processor exiting");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn handle_command(&self, cmd: CommandFrame) {
        tracing::debug!(id = cmd.id, op = %cmd.op, origin = ?cmd.origin, "command dispatched");

        let response = match self.services.get(cmd.op.as_str()) {
            Some(service) => {
                let outcome = service.handle(cmd.payload.as_deref());
                ResponseFrame::finish(&cmd, outcome.status, outcome.payload)
            }
            None => {
                tracing::debug!(op = %cmd.op, "unknown opcode");
                ResponseFrame::finish(&cmd, STATUS_UNKNOWN_OP, None)
            }
        };

        if !self.responses.offer(response) {
            self.registry.report(FaultEvent {
                component: Component::Processor,
                category: Category::Queue,
                severity: Severity::Warning,
                code: -1,
                underlying_code: 0,
                context: "response enqueue".into(),
                description: format!("response for command {} dropped", cmd.id),
            });
        }
        // cmd (and its payload) is released here, after dispatch.
    }
}
