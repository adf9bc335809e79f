//! Error types for the revive runtime
//!
//! Domain errors use thiserror, one enum per concern. Only [`MessageError`]
//! ever reaches the transport boundary; snapshot, store and transport errors
//! are recovered or logged inside an invocation.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Inbound message was rejected
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Snapshot envelope errors
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Snapshot store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Batch delivery errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Evaluation engine errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Reasons an inbound message is rejected before any session is touched
#[derive(Debug, Error)]
pub enum MessageError {
    /// Body could not be parsed as an inbound message
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The session namespace (`serverID`) is not served here
    #[error("unknown session namespace: {0:?}")]
    UnknownNamespace(Option<String>),

    /// `workerID` missing or empty
    #[error("invalid worker identity")]
    InvalidIdentity,
}

impl MessageError {
    /// Status code reported to the transport for this rejection
    pub fn status(&self) -> StatusCode {
        match self {
            MessageError::Malformed(_) | MessageError::InvalidIdentity => StatusCode::BadRequest,
            MessageError::UnknownNamespace(_) => StatusCode::NotFound,
        }
    }
}

/// Snapshot envelope errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Envelope frame is shorter than its declared lengths
    #[error("Truncated envelope: {0}")]
    Truncated(String),

    /// Invalid envelope header
    #[error("Invalid snapshot format: {0}")]
    InvalidFormat(String),

    /// Format version outside the supported window
    #[error("Unsupported format version {found} (supported {min}..={max})")]
    UnsupportedVersion {
        /// Version found in the envelope
        found: u32,
        /// Oldest readable version
        min: u32,
        /// Newest readable version
        max: u32,
    },

    /// Engine state digest does not match the header
    #[error("State digest mismatch for worker '{0}'")]
    DigestMismatch(String),

    /// Envelope belongs to another worker
    #[error("Envelope for worker '{found}' loaded under key for '{expected}'")]
    WorkerMismatch {
        /// Worker the key was derived from
        expected: String,
        /// Worker recorded in the envelope
        found: String,
    },

    /// Engine refused to export its state
    #[error("Engine export failed: {0}")]
    Export(#[from] EngineError),
}

/// Convenience result alias for snapshot operations
pub type SnapshotResult<T> = std::result::Result<T, SnapshotError>;

/// Snapshot store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key cannot be mapped onto the backing store
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// Background I/O task did not complete
    #[error("Store task failed: {0}")]
    Task(String),

    /// Backend refused the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Batch delivery errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Receiving side has gone away
    #[error("Connection closed")]
    Closed,
}

/// Errors reported by an evaluation engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Imported state could not be understood
    #[error("Invalid engine state: {0}")]
    InvalidState(String),

    /// State could not be serialized
    #[error("State export failed: {0}")]
    Export(String),
}

/// Convenience result alias for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Response codes at the transport boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Invocation completed
    Ok,
    /// Malformed request or invalid identity
    BadRequest,
    /// Unrecognized session namespace
    NotFound,
    /// An upstream dependency (batch delivery) failed
    BadGateway,
}

impl StatusCode {
    /// HTTP-equivalent numeric code
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Ok => 200,
            StatusCode::BadRequest => 400,
            StatusCode::NotFound => 404,
            StatusCode::BadGateway => 502,
        }
    }

    /// Whether the invocation succeeded
    pub fn is_success(self) -> bool {
        self == StatusCode::Ok
    }
}

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;
