//! sluiced — daemon internals: queues, backoff, command processor,
//! transport workers, and the runtime composition root.
//!
//! Exposed as a library so the integration tests can build a full runtime
//! around in-memory drivers.

pub mod backoff;
pub mod processor;
pub mod queue;
pub mod runtime;
pub mod transport;
