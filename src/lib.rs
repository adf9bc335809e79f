//! revive – session resurrection and execution scheduling for stateless hosts
//!
//! This crate lets a request/response environment, where every invocation
//! may land in a fresh process, present one continuously running interactive
//! session to a remote client:
//! - Each inbound message is classified as continue, resurrect or reset
//! - The embedded engine is driven to quiescence cooperatively
//! - Output is delivered as exactly one ordered batch per invocation
//! - Engine state is persisted after the batch, when asked to
//! - An NDJSON service and CLI drive the runtime over stdio

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime core: sequencing, sessions, scheduling, batching and snapshots
pub mod runtime;

/// Reference calculator engine
pub mod interpreter;

/// NDJSON service front end
pub mod service;

// Re-export key types for convenience
pub use runtime::{InvocationReport, Runtime, RuntimeConfig};

/// Current version of the revive runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version for the NDJSON service
pub const PROTOCOL_VERSION: &str = "1.0.0";
