//! Transport workers.
//!
//! Concrete drivers (the radio stack, the broker client) live outside the
//! daemon. Each driver boundary is a pair of channels: typed events in,
//! typed commands out. Application code therefore never runs inside a
//! driver's dispatch context, and the tests drive transports with plain
//! channel endpoints.

pub mod broker;
pub mod gatt;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One-shot reconnect/re-advertise timer.
///
/// Arming while a fire is already pending is a no-op, so every code path
/// that wants "retry later" can call `arm` without bookkeeping. A
/// successful connect cancels the pending fire.
pub(crate) struct OneShotTimer {
    handle: Option<JoinHandle<()>>,
}

impl OneShotTimer {
    pub(crate) fn new() -> Self {
        Self { handle: None }
    }

    pub(crate) fn arm(&mut self, delay: Duration, fire: mpsc::Sender<()>) {
        if let Some(handle) = &self.handle {
            if !handle.is_finished() {
                return;
            }
        }
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = fire.send(()).await;
        }));
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
