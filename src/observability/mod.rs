//! Observability subsystem.
//!
//! # Design Decisions
//! - Structured logging via the `tracing` crate throughout the runtime.
//! - JSON format for production, pretty format for development.
//! - Level configurable via config, overridable with `RUST_LOG`.

pub mod logging;

pub use logging::init_tracing;
