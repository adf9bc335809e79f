//! Session registry
//!
//! Owns the single live [`Session`] of this process. Every lifecycle
//! operation either reuses the session in place or replaces it wholesale;
//! the previous engine handle is dropped before a new one is built, so two
//! engines never run side by side.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::aggregator::Outbox;
use super::engine::{Engine, EngineEvent, EngineFactory, EventKind};
use super::message::{OutputEvent, WorkerId};
use super::snapshot::SnapshotEnvelope;

/// The live binding of a worker identity to an engine handle
pub struct Session {
    worker_id: WorkerId,
    counter: u64,
    options: Option<Value>,
    engine: Box<dyn Engine>,
    outbox: Outbox,
    save_requested: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
    typeahead: String,
    interactive: bool,
}

impl Session {
    /// Bind a freshly built engine to a worker and wire its subscriptions
    fn new(
        worker_id: WorkerId,
        counter: u64,
        options: Option<Value>,
        mut engine: Box<dyn Engine>,
    ) -> Self {
        let outbox = Outbox::new();
        let save_requested = Arc::new(AtomicBool::new(false));
        let wakeup = Arc::new(Notify::new());

        let sink = outbox.clone();
        engine.subscribe(
            EventKind::Output,
            Box::new(move |event| match event {
                EngineEvent::Console(text) => sink.push(OutputEvent::text(text.clone())),
                EngineEvent::Debug { text, level } => {
                    debug!(level = *level, "engine: {}", text.trim_end());
                    sink.push(OutputEvent::debug(text.clone(), *level));
                }
                _ => {}
            }),
        );

        let rearm = wakeup.clone();
        engine.subscribe(
            EventKind::Interrupted,
            Box::new(move |_| rearm.notify_one()),
        );

        let flag = save_requested.clone();
        engine.subscribe(
            EventKind::SaveRequested,
            Box::new(move |event| {
                if let EngineEvent::SaveRequested(save) = event {
                    flag.store(*save, Ordering::SeqCst);
                }
            }),
        );

        Self {
            worker_id,
            counter,
            options,
            engine,
            outbox,
            save_requested,
            wakeup,
            typeahead: String::new(),
            interactive: false,
        }
    }

    /// Worker this session belongs to
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Counter of the last applied message
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Options captured at spawn or restore time
    pub fn options(&self) -> Option<&Value> {
        self.options.as_ref()
    }

    /// Replace the captured options
    pub fn set_options(&mut self, options: Option<Value>) {
        self.options = options;
    }

    /// The engine handle
    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }

    /// Mutable access to the engine handle
    pub fn engine_mut(&mut self) -> &mut dyn Engine {
        self.engine.as_mut()
    }

    /// Output collected during the current invocation
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// Whether this invocation should persist state once quiescent
    pub fn save_requested(&self) -> bool {
        self.save_requested.load(Ordering::SeqCst)
    }

    /// Ask for a save at the end of this invocation
    pub fn request_save(&self) {
        self.save_requested.store(true, Ordering::SeqCst);
    }

    /// Signal raised when the engine wants to be driven again
    pub fn wakeup(&self) -> Arc<Notify> {
        self.wakeup.clone()
    }

    /// Append text to the input queue
    pub fn queue_input(&mut self, text: &str, interactive: bool) {
        self.typeahead.push_str(text);
        self.interactive |= interactive;
    }

    /// Whether input is waiting to be fed to the engine
    pub fn has_typeahead(&self) -> bool {
        !self.typeahead.is_empty()
    }

    /// Take queued input as one newline-terminated block
    pub fn take_typeahead(&mut self) -> Option<(String, bool)> {
        if self.typeahead.is_empty() {
            return None;
        }
        let mut text = std::mem::take(&mut self.typeahead);
        text.push('\n');
        Some((text, self.interactive))
    }

    /// Move pending console text from the engine into the outbox
    pub fn drain_engine_output(&mut self) {
        let text = self.engine.drain_output();
        if !text.is_empty() {
            self.outbox.push(OutputEvent::text(text));
        }
    }

    /// Clear per-invocation state and record the new counter
    fn begin_invocation(&mut self, counter: u64) {
        self.counter = counter;
        self.outbox.clear();
        self.save_requested.store(false, Ordering::SeqCst);
        self.typeahead.clear();
        self.interactive = false;
    }

    /// Run the default bootstrap and queue the initialization script
    fn boot(&mut self, init_script: Option<String>) {
        self.engine.bootstrap_default();
        self.engine.announce_startup();

        // Boot output stays server-side; only subscribed events reach the client.
        loop {
            let text = self.engine.drain_output();
            if !text.is_empty() {
                debug!(worker = %self.worker_id, "boot: {}", text.trim_end());
            }
            if !self.engine.step() {
                break;
            }
        }
        let text = self.engine.drain_output();
        if !text.is_empty() {
            debug!(worker = %self.worker_id, "boot: {}", text.trim_end());
        }

        if let Some(script) = init_script {
            self.queue_input(&script, false);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("worker_id", &self.worker_id)
            .field("counter", &self.counter)
            .field("options", &self.options)
            .field("outbox", &self.outbox.len())
            .field("save_requested", &self.save_requested())
            .finish()
    }
}

/// Holder of the process-wide session
pub struct SessionRegistry<F> {
    factory: F,
    current: Option<Session>,
}

impl<F: EngineFactory> SessionRegistry<F> {
    /// Create an empty registry
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            current: None,
        }
    }

    /// The live session, if any
    pub fn current(&self) -> Option<&Session> {
        self.current.as_ref()
    }

    /// Reuse the live session for the next message.
    ///
    /// Only per-invocation state is cleared. If no session is held the
    /// registry starts a fresh one instead.
    pub fn continue_session(&mut self, worker_id: WorkerId, counter: u64) -> &mut Session {
        match self.current.take() {
            Some(mut session) => {
                info!(worker = %session.worker_id, counter, "reusing instance");
                session.begin_invocation(counter);
                self.current.insert(session)
            }
            None => {
                warn!(worker = %worker_id, counter, "no instance to continue");
                self.reset(worker_id, counter, None)
            }
        }
    }

    /// Replace the live session with a freshly booted one
    pub fn reset(&mut self, worker_id: WorkerId, counter: u64, options: Option<Value>) -> &mut Session {
        self.discard();
        info!(worker = %worker_id, counter, "reset instance");

        let mut session = Session::new(worker_id, counter, options, self.factory.build());
        session.boot(self.factory.init_script());
        self.current.insert(session)
    }

    /// Replace the live session with one restored from `envelope`.
    ///
    /// A missing envelope, or one the engine refuses to import, falls back
    /// to a full reset. Import failures are logged, never returned.
    pub fn resurrect(
        &mut self,
        worker_id: WorkerId,
        counter: u64,
        envelope: Option<SnapshotEnvelope>,
    ) -> &mut Session {
        self.discard();

        let Some(envelope) = envelope else {
            info!(worker = %worker_id, counter, "new instance without snapshot");
            return self.reset(worker_id, counter, None);
        };

        let mut engine = self.factory.build();
        match engine.import_state(&envelope.state) {
            Ok(()) => {
                info!(
                    worker = %worker_id,
                    counter,
                    bytes = envelope.state.len(),
                    "new instance restored from snapshot"
                );
                let session = Session::new(worker_id, counter, envelope.options, engine);
                self.current.insert(session)
            }
            Err(err) => {
                warn!(worker = %worker_id, error = %err, "state import failed");
                drop(engine);
                self.reset(worker_id, counter, None)
            }
        }
    }

    // Drops the held engine before a replacement is built.
    fn discard(&mut self) {
        if let Some(previous) = self.current.take() {
            debug!(worker = %previous.worker_id(), counter = previous.counter(), "discarding session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::CalcFactory;

    fn worker(id: &str) -> WorkerId {
        WorkerId::new(id).unwrap()
    }

    #[test]
    fn test_reset_creates_fresh_session() {
        let mut registry = SessionRegistry::new(CalcFactory::new());
        let session = registry.reset(worker("W1"), 1, Some(serde_json::json!({"mode": "x"})));

        assert_eq!(session.worker_id().as_str(), "W1");
        assert_eq!(session.counter(), 1);
        assert_eq!(session.options().unwrap()["mode"], "x");
        assert!(!session.save_requested());
    }

    #[test]
    fn test_reset_queues_init_script() {
        let factory = CalcFactory::new().with_init_script("let seed = 7");
        let mut registry = SessionRegistry::new(factory);
        let session = registry.reset(worker("W1"), 1, None);

        assert!(session.has_typeahead());
        let (text, interactive) = session.take_typeahead().unwrap();
        assert_eq!(text, "let seed = 7\n");
        assert!(!interactive);
    }

    #[test]
    fn test_continue_clears_invocation_state() {
        let mut registry = SessionRegistry::new(CalcFactory::new());
        {
            let session = registry.reset(worker("W1"), 1, None);
            session.request_save();
            session.queue_input("1+1", true);
            session.outbox().push(OutputEvent::text("stale"));
        }

        let session = registry.continue_session(worker("W1"), 2);
        assert_eq!(session.counter(), 2);
        assert!(session.outbox().is_empty());
        assert!(!session.save_requested());
        assert!(!session.has_typeahead());
    }

    #[test]
    fn test_resurrect_without_envelope_falls_back_to_reset() {
        let mut registry = SessionRegistry::new(CalcFactory::new());
        registry.reset(worker("OLD"), 4, None);

        let session = registry.resurrect(worker("W1"), 9, None);
        assert_eq!(session.worker_id().as_str(), "W1");
        assert_eq!(session.counter(), 9);
        assert!(session.options().is_none());
    }

    #[test]
    fn test_resurrect_with_corrupt_state_falls_back_to_reset() {
        let mut registry = SessionRegistry::new(CalcFactory::new());
        let envelope = SnapshotEnvelope {
            worker_id: worker("W1"),
            counter: 3,
            options: Some(serde_json::json!({"restored": true})),
            format_version: crate::runtime::snapshot::FORMAT_VERSION,
            saved_at: chrono::Utc::now(),
            state: b"not engine state".to_vec(),
        };

        let session = registry.resurrect(worker("W1"), 5, Some(envelope));
        assert_eq!(session.counter(), 5);
        // Options from a rejected envelope are not adopted.
        assert!(session.options().is_none());
    }

    #[test]
    fn test_engine_save_event_sets_flag() {
        let mut registry = SessionRegistry::new(CalcFactory::new());
        let session = registry.reset(worker("W1"), 1, None);
        session.engine_mut().feed_input("save\n", true);
        while session.engine_mut().step() {}
        assert!(session.save_requested());
    }
}
