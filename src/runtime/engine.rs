//! Evaluation engine capability set
//!
//! The runtime never interprets program text itself. It drives an [`Engine`]
//! through this narrow interface and learns about asynchronous happenings
//! (console output, interrupts, save requests) through subscriptions.

use super::error::EngineResult;

/// Kinds of engine notifications a host can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Console or diagnostic output was produced
    Output,
    /// A previously requested escape took effect
    Interrupted,
    /// Code inside the engine asked for (or cancelled) a save
    SaveRequested,
}

/// Notification raised by an engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Console text
    Console(String),
    /// Diagnostic text with a severity level
    Debug {
        /// Diagnostic text
        text: String,
        /// Engine-defined severity
        level: u8,
    },
    /// Escape handled; the host should resume driving the engine
    Interrupted,
    /// Save flag set programmatically for the current invocation
    SaveRequested(bool),
}

impl EngineEvent {
    /// Subscription kind this event is delivered to
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::Console(_) | EngineEvent::Debug { .. } => EventKind::Output,
            EngineEvent::Interrupted => EventKind::Interrupted,
            EngineEvent::SaveRequested(_) => EventKind::SaveRequested,
        }
    }
}

/// Subscriber callback.
///
/// Handlers run synchronously inside engine calls, so they must only record
/// the event; they never call back into the engine or the scheduler.
pub type EventHandler = Box<dyn FnMut(&EngineEvent) + Send>;

/// A resumable interpreter
pub trait Engine: Send {
    /// Run one unit of work. Returns true while more work is pending.
    fn step(&mut self) -> bool;

    /// Take any console text produced since the last drain
    fn drain_output(&mut self) -> String;

    /// Queue input text; `interactive` marks keyboard input
    fn feed_input(&mut self, text: &str, interactive: bool);

    /// Request an escape of the running computation
    fn interrupt(&mut self);

    /// Register a handler for one kind of notification
    fn subscribe(&mut self, kind: EventKind, handler: EventHandler);

    /// Serialize the complete engine state
    fn export_state(&self) -> EngineResult<Vec<u8>>;

    /// Replace the engine state with a previously exported one
    fn import_state(&mut self, state: &[u8]) -> EngineResult<()>;

    /// Reset to the default (empty) state
    fn bootstrap_default(&mut self);

    /// Emit the startup banner and run boot sequences
    fn announce_startup(&mut self);
}

/// Builds fresh engine handles for the session registry
pub trait EngineFactory {
    /// Construct an engine in its pristine state
    fn build(&self) -> Box<dyn Engine>;

    /// Script queued as typeahead after a reset, if any
    fn init_script(&self) -> Option<String> {
        None
    }
}

impl<F: EngineFactory + ?Sized> EngineFactory for &F {
    fn build(&self) -> Box<dyn Engine> {
        (**self).build()
    }

    fn init_script(&self) -> Option<String> {
        (**self).init_script()
    }
}

/// Subscription table for engine implementations
#[derive(Default)]
pub struct EventHub {
    handlers: Vec<(EventKind, EventHandler)>,
}

impl EventHub {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler
    pub fn subscribe(&mut self, kind: EventKind, handler: EventHandler) {
        self.handlers.push((kind, handler));
    }

    /// Deliver an event to every handler of its kind, in subscription order
    pub fn emit(&mut self, event: EngineEvent) {
        let kind = event.kind();
        for (subscribed, handler) in self.handlers.iter_mut() {
            if *subscribed == kind {
                handler(&event);
            }
        }
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_event_hub_routes_by_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut hub = EventHub::new();

        let output = seen.clone();
        hub.subscribe(
            EventKind::Output,
            Box::new(move |event| output.lock().push(format!("out:{:?}", event))),
        );
        let interrupts = seen.clone();
        hub.subscribe(
            EventKind::Interrupted,
            Box::new(move |_| interrupts.lock().push("int".to_string())),
        );

        hub.emit(EngineEvent::Console("a".into()));
        hub.emit(EngineEvent::Interrupted);
        hub.emit(EngineEvent::SaveRequested(true));

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("out:"));
        assert_eq!(seen[1], "int");
        assert_eq!(hub.len(), 2);
    }
}
