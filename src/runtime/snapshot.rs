//! Snapshot envelopes and the save/load policy
//!
//! An envelope is written only after an invocation reached quiescence. On
//! disk it is framed as
//!
//! ```text
//! u32 LE header length | header JSON | engine state bytes
//! ```
//!
//! The header records the format version, worker, options and a blake3
//! digest of the state. Anything that fails to decode is reported as a
//! [`SnapshotError`], and [`SnapshotPolicy::load`] turns every such failure
//! into "no snapshot".

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::error::{Result, SnapshotError, SnapshotResult};
use super::message::WorkerId;
use super::registry::Session;
use super::storage::SnapshotStore;

/// Envelope format written by this build
pub const FORMAT_VERSION: u32 = 1;

/// Oldest envelope format this build can read
pub const MIN_FORMAT_VERSION: u32 = 1;

/// Size of the header length prefix
const LEN_PREFIX: usize = 4;

/// Durable serialization of one worker's session
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotEnvelope {
    /// Worker the state belongs to
    pub worker_id: WorkerId,
    /// Counter of the invocation that produced the snapshot (diagnostic only)
    pub counter: u64,
    /// Session options captured alongside the state
    pub options: Option<Value>,
    /// Envelope format version
    pub format_version: u32,
    /// When the snapshot was taken
    pub saved_at: DateTime<Utc>,
    /// Opaque engine state
    pub state: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeHeader {
    format_version: u32,
    #[serde(rename = "workerID")]
    worker_id: WorkerId,
    counter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<Value>,
    saved_at: DateTime<Utc>,
    state_len: u64,
    state_digest: String,
}

fn state_digest(state: &[u8]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(state);
    hasher.finalize().to_hex().to_string()
}

impl SnapshotEnvelope {
    /// Capture a quiescent session
    pub fn capture(session: &Session) -> SnapshotResult<Self> {
        let state = session.engine().export_state()?;
        Ok(Self {
            worker_id: session.worker_id().clone(),
            counter: session.counter(),
            options: session.options().cloned(),
            format_version: FORMAT_VERSION,
            saved_at: Utc::now(),
            state,
        })
    }

    /// Encode into the framed binary form
    pub fn encode(&self) -> SnapshotResult<Vec<u8>> {
        let header = EnvelopeHeader {
            format_version: self.format_version,
            worker_id: self.worker_id.clone(),
            counter: self.counter,
            options: self.options.clone(),
            saved_at: self.saved_at,
            state_len: self.state.len() as u64,
            state_digest: state_digest(&self.state),
        };
        let header = serde_json::to_vec(&header)
            .map_err(|e| SnapshotError::InvalidFormat(e.to_string()))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| SnapshotError::InvalidFormat("header too large".to_string()))?;

        let mut out = Vec::with_capacity(LEN_PREFIX + header.len() + self.state.len());
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.state);
        Ok(out)
    }

    /// Decode and validate the framed binary form
    pub fn decode(bytes: &[u8]) -> SnapshotResult<Self> {
        if bytes.len() < LEN_PREFIX {
            return Err(SnapshotError::Truncated(format!(
                "{} bytes, no header length",
                bytes.len()
            )));
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&bytes[..LEN_PREFIX]);
        let header_len = u32::from_le_bytes(prefix) as usize;

        let rest = &bytes[LEN_PREFIX..];
        if rest.len() < header_len {
            return Err(SnapshotError::Truncated(format!(
                "header wants {} bytes, {} available",
                header_len,
                rest.len()
            )));
        }
        let (header, state) = rest.split_at(header_len);
        let header: EnvelopeHeader = serde_json::from_slice(header)
            .map_err(|e| SnapshotError::InvalidFormat(e.to_string()))?;

        if !(MIN_FORMAT_VERSION..=FORMAT_VERSION).contains(&header.format_version) {
            return Err(SnapshotError::UnsupportedVersion {
                found: header.format_version,
                min: MIN_FORMAT_VERSION,
                max: FORMAT_VERSION,
            });
        }
        if header.state_len != state.len() as u64 {
            return Err(SnapshotError::Truncated(format!(
                "state wants {} bytes, {} available",
                header.state_len,
                state.len()
            )));
        }
        if header.state_digest != state_digest(state) {
            return Err(SnapshotError::DigestMismatch(header.worker_id.to_string()));
        }

        Ok(Self {
            worker_id: header.worker_id,
            counter: header.counter,
            options: header.options,
            format_version: header.format_version,
            saved_at: header.saved_at,
            state: state.to_vec(),
        })
    }
}

/// Decides where snapshots live and performs the load/save steps
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    key_prefix: String,
}

impl SnapshotPolicy {
    /// Create a policy storing snapshots under `key_prefix`
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
        }
    }

    /// Store key for a worker's snapshot
    pub fn key_for(&self, worker: &WorkerId) -> String {
        format!("{}{}.state", self.key_prefix, worker)
    }

    /// Load the snapshot for `worker`.
    ///
    /// Store errors and undecodable envelopes are logged and reported as
    /// `None`; the caller always gets something it can boot from.
    pub async fn load<S: SnapshotStore + ?Sized>(
        &self,
        store: &S,
        worker: &WorkerId,
    ) -> Option<SnapshotEnvelope> {
        let key = self.key_for(worker);
        let bytes = match store.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(worker = %worker, key = %key, "no snapshot stored");
                return None;
            }
            Err(err) => {
                warn!(worker = %worker, key = %key, error = %err, "snapshot load failed");
                return None;
            }
        };

        let envelope = match SnapshotEnvelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(worker = %worker, key = %key, error = %err, "snapshot rejected");
                return None;
            }
        };

        if envelope.worker_id != *worker {
            let err = SnapshotError::WorkerMismatch {
                expected: worker.to_string(),
                found: envelope.worker_id.to_string(),
            };
            warn!(key = %key, error = %err, "snapshot rejected");
            return None;
        }

        debug!(
            worker = %worker,
            bytes = envelope.state.len(),
            saved_at = %envelope.saved_at,
            "snapshot loaded"
        );
        Some(envelope)
    }

    /// Capture and store the session; returns the envelope size in bytes.
    ///
    /// The session must be quiescent.
    pub async fn persist<S: SnapshotStore + ?Sized>(
        &self,
        store: &S,
        session: &Session,
    ) -> Result<usize> {
        let envelope = SnapshotEnvelope::capture(session)?;
        let bytes = envelope.encode()?;
        let len = bytes.len();
        store.put(&self.key_for(session.worker_id()), bytes).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> SnapshotEnvelope {
        SnapshotEnvelope {
            worker_id: WorkerId::new("W1").unwrap(),
            counter: 4,
            options: Some(serde_json::json!({"theme": "dark"})),
            format_version: FORMAT_VERSION,
            saved_at: Utc::now(),
            state: b"{\"vars\":{\"x\":2}}".to_vec(),
        }
    }

    #[test]
    fn test_envelope_encode_decode() {
        let original = envelope();
        let bytes = original.encode().unwrap();
        let decoded = SnapshotEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_envelope_rejects_truncation() {
        let bytes = envelope().encode().unwrap();
        assert!(matches!(
            SnapshotEnvelope::decode(&bytes[..2]),
            Err(SnapshotError::Truncated(_))
        ));
        assert!(matches!(
            SnapshotEnvelope::decode(&bytes[..10]),
            Err(SnapshotError::Truncated(_))
        ));
        assert!(matches!(
            SnapshotEnvelope::decode(&bytes[..bytes.len() - 1]),
            Err(SnapshotError::Truncated(_))
        ));
    }

    #[test]
    fn test_envelope_rejects_tampered_state() {
        let mut bytes = envelope().encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            SnapshotEnvelope::decode(&bytes),
            Err(SnapshotError::DigestMismatch(_))
        ));
    }

    #[test]
    fn test_envelope_version_window() {
        for version in [MIN_FORMAT_VERSION - 1, FORMAT_VERSION + 1] {
            let mut outside = envelope();
            outside.format_version = version;
            let bytes = outside.encode().unwrap();
            match SnapshotEnvelope::decode(&bytes) {
                Err(SnapshotError::UnsupportedVersion { found, min, max }) => {
                    assert_eq!(found, version);
                    assert_eq!((min, max), (MIN_FORMAT_VERSION, FORMAT_VERSION));
                }
                other => panic!("unexpected result for {}: {:?}", version, other),
            }
        }

        for version in MIN_FORMAT_VERSION..=FORMAT_VERSION {
            let mut inside = envelope();
            inside.format_version = version;
            let decoded = SnapshotEnvelope::decode(&inside.encode().unwrap()).unwrap();
            assert_eq!(decoded.format_version, version);
        }
    }

    #[test]
    fn test_envelope_rejects_garbage_header() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"{{{");
        assert!(matches!(
            SnapshotEnvelope::decode(&bytes),
            Err(SnapshotError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_key_for_worker() {
        let policy = SnapshotPolicy::new("revive-");
        let worker = WorkerId::new("W1").unwrap();
        assert_eq!(policy.key_for(&worker), "revive-W1.state");
    }
}
