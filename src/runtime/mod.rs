//! Runtime orchestrator and public API
//!
//! This module provides the main `Runtime` struct that ties the sequencer,
//! session registry, scheduler, aggregator and snapshot policy together and
//! exposes one entry point per inbound message.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

// Submodules
pub mod aggregator;
pub mod engine;
pub mod error;
pub mod message;
pub mod registry;
pub mod scheduler;
pub mod sequencer;
pub mod snapshot;
pub mod storage;
pub mod transport;

use aggregator::{Aggregator, SaveOutcome};
use engine::EngineFactory;
use error::StatusCode;
use message::{InboundMessage, OutputEvent, WorkerOp};
use registry::{Session, SessionRegistry};
use scheduler::{RunReport, Scheduler};
use sequencer::Decision;
use snapshot::SnapshotPolicy;
use storage::SnapshotStore;
use transport::Transport;

/// Configuration for the revive runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for file-backed snapshots (default: .revive/)
    pub store_root: PathBuf,

    /// Prefix of every snapshot key
    pub key_prefix: String,

    /// Accepted `serverID`; any namespace is accepted when unset
    pub namespace: Option<String>,

    /// Grace period before an idle engine counts as quiescent
    pub idle_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from(".revive"),
            key_prefix: "revive-".to_string(),
            namespace: None,
            idle_grace_ms: 10,
        }
    }
}

impl RuntimeConfig {
    /// Idle grace as a duration
    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }
}

/// Everything that happened during one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationReport {
    /// Id of the invocation's tracing span
    pub invocation: Uuid,
    /// How the message was bound to a session
    pub decision: Decision,
    /// Status reported back to the host
    pub status: StatusCode,
    /// Items carried by the batch
    pub items: usize,
    /// Save step result
    pub save: SaveOutcome,
    /// Scheduler counters
    pub run: RunReport,
}

/// The main runtime orchestrator
///
/// Holds the process-wide session. `invoke` takes `&mut self`, so at most
/// one invocation touches the session at a time.
pub struct Runtime<S, F> {
    config: RuntimeConfig,
    store: S,
    registry: SessionRegistry<F>,
    policy: SnapshotPolicy,
}

impl<S: SnapshotStore, F: EngineFactory> Runtime<S, F> {
    /// Create a runtime over `store`, building engines with `factory`
    pub fn new(config: RuntimeConfig, store: S, factory: F) -> Self {
        let policy = SnapshotPolicy::new(config.key_prefix.clone());
        Self {
            config,
            store,
            registry: SessionRegistry::new(factory),
            policy,
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Get the snapshot store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the snapshot policy
    pub fn policy(&self) -> &SnapshotPolicy {
        &self.policy
    }

    /// Get the session registry
    pub fn registry(&self) -> &SessionRegistry<F> {
        &self.registry
    }

    /// The live session, if any
    pub fn session(&self) -> Option<&Session> {
        self.registry.current()
    }

    /// Handle a raw message body from the transport adapter.
    ///
    /// An empty body is a connect handshake and is answered without
    /// touching the session.
    pub async fn handle_body<T: Transport + ?Sized>(
        &mut self,
        body: Option<&str>,
        transport: &T,
    ) -> StatusCode {
        let Some(body) = body.filter(|b| !b.trim().is_empty()) else {
            debug!("empty body");
            return StatusCode::Ok;
        };

        match InboundMessage::parse(body, self.config.namespace.as_deref()) {
            Ok(message) => self.invoke(message, transport).await.status,
            Err(err) => {
                let status = err.status();
                warn!(error = %err, status = status.as_u16(), "message rejected");
                status
            }
        }
    }

    /// Process one validated message end to end
    pub async fn invoke<T: Transport + ?Sized>(
        &mut self,
        message: InboundMessage,
        transport: &T,
    ) -> InvocationReport {
        let invocation = Uuid::new_v4();
        let span = info_span!(
            "invocation",
            %invocation,
            worker = %message.worker_id,
            counter = message.counter
        );
        self.run_invocation(invocation, message, transport)
            .instrument(span)
            .await
    }

    async fn run_invocation<T: Transport + ?Sized>(
        &mut self,
        invocation: Uuid,
        message: InboundMessage,
        transport: &T,
    ) -> InvocationReport {
        let decision = sequencer::classify(&message, self.registry.current());
        info!(decision = decision.as_str(), op = ?message.op, "message classified");

        let worker = message.worker_id.clone();
        let counter = message.counter;

        let session = match decision {
            Decision::Continue => self.registry.continue_session(worker, counter),
            Decision::Reset => {
                self.registry
                    .reset(worker, counter, message.payload.options.clone())
            }
            Decision::Resurrect => {
                let envelope = self.policy.load(&self.store, &worker).await;
                if let Some(envelope) = &envelope {
                    // The message counter wins; the stored one is informational.
                    debug!(stored_counter = envelope.counter, counter, "adopting message counter");
                }
                self.registry.resurrect(worker, counter, envelope)
            }
        };

        apply(session, &message);

        let mut scheduler = Scheduler::new(self.config.idle_grace());
        let run = scheduler.run(session).await;

        let report = Aggregator::new(transport)
            .finalize(&message, session, &self.policy, &self.store)
            .await;

        info!(
            status = report.status.as_u16(),
            items = report.items,
            save = ?report.save,
            "invocation finalized"
        );

        InvocationReport {
            invocation,
            decision,
            status: report.status,
            items: report.items,
            save: report.save,
            run,
        }
    }
}

/// Apply the message payload to the bound session
fn apply(session: &mut Session, message: &InboundMessage) {
    let payload = &message.payload;

    if message.op == WorkerOp::Spawn {
        if let Some(options) = &payload.options {
            session.set_options(Some(options.clone()));
        }
        session
            .outbox()
            .push(OutputEvent::started(&message.worker_id, message.counter));
    }

    if payload.save {
        session.request_save();
    }
    if payload.interrupt {
        debug!("forwarding interrupt");
        session.engine_mut().interrupt();
    }
    if let Some(text) = &payload.text {
        session.queue_input(text, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::CalcFactory;
    use crate::runtime::message::{Payload, WorkerId};
    use crate::runtime::storage::MemoryStore;
    use crate::runtime::transport::CollectingTransport;

    fn runtime() -> Runtime<MemoryStore, CalcFactory> {
        Runtime::new(RuntimeConfig::default(), MemoryStore::new(), CalcFactory::new())
    }

    fn message(counter: u64, op: WorkerOp, payload: Payload) -> InboundMessage {
        InboundMessage {
            worker_id: WorkerId::new("W1").unwrap(),
            counter,
            op,
            payload,
            server_id: None,
            client_id: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.key_prefix, "revive-");
        assert_eq!(config.idle_grace(), Duration::from_millis(10));
        assert!(config.namespace.is_none());
    }

    #[tokio::test]
    async fn test_spawn_then_continue() {
        let mut runtime = runtime();
        let transport = CollectingTransport::new();

        let spawn = Payload {
            reset: true,
            ..Payload::default()
        };
        let report = runtime
            .invoke(message(1, WorkerOp::Spawn, spawn), &transport)
            .await;
        assert_eq!(report.decision, Decision::Reset);
        assert_eq!(report.status, StatusCode::Ok);

        let input = Payload {
            text: Some("6*7".to_string()),
            ..Payload::default()
        };
        let report = runtime
            .invoke(message(2, WorkerOp::Continue, input), &transport)
            .await;
        assert_eq!(report.decision, Decision::Continue);

        let batches = transport.take();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].items[0].control_id(), Some("started"));
        assert_eq!(batches[1].items, vec![OutputEvent::text("42\n")]);
        assert_eq!(runtime.store().get_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_body_is_accepted_without_session() {
        let mut runtime = runtime();
        let transport = CollectingTransport::new();

        assert_eq!(runtime.handle_body(None, &transport).await, StatusCode::Ok);
        assert_eq!(runtime.handle_body(Some("  "), &transport).await, StatusCode::Ok);
        assert!(runtime.session().is_none());
        assert!(transport.is_empty());
    }

    #[tokio::test]
    async fn test_spawn_options_override_restored_ones() {
        let mut runtime = runtime();
        let transport = CollectingTransport::new();

        let spawn = Payload {
            options: Some(serde_json::json!({"mode": "fresh"})),
            ..Payload::default()
        };
        runtime
            .invoke(message(5, WorkerOp::Spawn, spawn), &transport)
            .await;

        let session = runtime.session().unwrap();
        assert_eq!(session.options().unwrap()["mode"], "fresh");
        assert_eq!(session.counter(), 5);
    }
}
