//! Message sequencing
//!
//! Classifies each inbound message against the session currently held in
//! memory. The rules are checked in order and the first match wins:
//!
//! 1. `spawn` with `reset` → [`Decision::Reset`], whatever is held.
//! 2. same worker and `counter == held + 1` → [`Decision::Continue`].
//! 3. anything else → [`Decision::Resurrect`].
//!
//! A resurrected session takes its counter from the message as-is. No
//! high-water mark is consulted, so a replayed message after a cold start is
//! processed again.

use super::message::{InboundMessage, WorkerId};
use super::registry::Session;

/// How an inbound message binds to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Reuse the live session in place
    Continue,
    /// Replace the live session from durable storage
    Resurrect,
    /// Replace the live session with a fresh one
    Reset,
}

impl Decision {
    /// Short label for logs
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Continue => "continue",
            Decision::Resurrect => "resurrect",
            Decision::Reset => "reset",
        }
    }
}

/// Classify `message` against the live session
pub fn classify(message: &InboundMessage, session: Option<&Session>) -> Decision {
    classify_held(message, session.map(|s| (s.worker_id(), s.counter())))
}

/// Classify `message` against a held `(worker, counter)` pair
pub fn classify_held(message: &InboundMessage, held: Option<(&WorkerId, u64)>) -> Decision {
    if message.is_reset() {
        return Decision::Reset;
    }

    match held {
        Some((worker, counter))
            if *worker == message.worker_id && counter.checked_add(1) == Some(message.counter) =>
        {
            Decision::Continue
        }
        _ => Decision::Resurrect,
    }
}
