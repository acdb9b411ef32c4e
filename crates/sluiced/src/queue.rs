//! Bounded frame queues between transports and the processor.
//!
//! One MPSC command queue carries decoded commands inward; responses travel
//! back through a router that owns one bounded queue per transport and
//! routes on `origin`. Both sides drop on a full queue — a slow consumer
//! must not stall a transport — and every drop is counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use sluice_core::wire::{CommandFrame, Origin, ResponseFrame};

/// Cloneable producer handle for the command queue.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<CommandFrame>,
    dropped: Arc<AtomicU64>,
}

impl CommandSender {
    /// Non-blocking enqueue. Returns false (and drops the frame, payload
    /// included) when the queue is full or the processor is gone.
    pub fn offer(&self, frame: CommandFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "command queue full, dropping frame");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build the command queue. The receiver goes to the processor.
pub fn command_queue(capacity: usize) -> (CommandSender, mpsc::Receiver<CommandFrame>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        CommandSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Routes responses to the egress queue matching their origin.
///
/// Each transport TX worker consumes its own queue, so one slow link never
/// starves the other; workers still discard any foreign-origin frame that
/// reaches them.
#[derive(Clone)]
pub struct ResponseRouter {
    gatt_tx: mpsc::Sender<ResponseFrame>,
    broker_tx: mpsc::Sender<ResponseFrame>,
    dropped: Arc<AtomicU64>,
}

impl ResponseRouter {
    /// Non-blocking enqueue toward the frame's origin transport.
    pub fn offer(&self, frame: ResponseFrame) -> bool {
        let tx = match frame.origin {
            Origin::Gatt => &self.gatt_tx,
            Origin::Broker => &self.broker_tx,
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "response queue full, dropping frame");
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build the response queues. Receivers go to the two TX workers.
pub fn response_router(
    capacity: usize,
) -> (
    ResponseRouter,
    mpsc::Receiver<ResponseFrame>,
    mpsc::Receiver<ResponseFrame>,
) {
    let (gatt_tx, gatt_rx) = mpsc::channel(capacity);
    let (broker_tx, broker_rx) = mpsc::channel(capacity);
    (
        ResponseRouter {
            gatt_tx,
            broker_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        gatt_rx,
        broker_rx,
    )
}
