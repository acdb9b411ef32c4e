//! sluice-core — wire format, chunking, Security1 session, fault registry,
//! and configuration. All other sluice crates depend on this one.

pub mod chunk;
pub mod config;
pub mod fault;
pub mod security1;
pub mod wire;

pub use wire::{CommandFrame, Origin, ResponseFrame};
