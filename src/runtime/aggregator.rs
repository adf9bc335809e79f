//! Response aggregation and the finalize sequence
//!
//! Output produced during an invocation accumulates in an [`Outbox`] in
//! production order. When the scheduler reports quiescence the
//! [`Aggregator`] emits it as exactly one batch, and only once the send has
//! completed does it consult the snapshot policy.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::StatusCode;
use super::message::{InboundMessage, OutboundBatch, OutputEvent};
use super::registry::Session;
use super::snapshot::SnapshotPolicy;
use super::storage::SnapshotStore;
use super::transport::Transport;

/// Ordered output buffer shared with engine callbacks
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    items: Arc<Mutex<Vec<OutputEvent>>>,
}

impl Outbox {
    /// Create an empty outbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item
    pub fn push(&self, item: OutputEvent) {
        self.items.lock().push(item);
    }

    /// Remove and return every item, oldest first
    pub fn take(&self) -> Vec<OutputEvent> {
        std::mem::take(&mut *self.items.lock())
    }

    /// Drop every item
    pub fn clear(&self) {
        self.items.lock().clear();
    }

    /// Number of buffered items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the outbox is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// What happened to the optional save step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Neither the message nor the engine asked for a save
    NotRequested,
    /// Envelope written to the store
    Saved,
    /// Save attempted and failed (logged)
    Failed,
}

/// Result of the finalize sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeReport {
    /// Status reported back to the host
    pub status: StatusCode,
    /// Items carried by the batch
    pub items: usize,
    /// Save step result
    pub save: SaveOutcome,
}

/// Emits the single batch for an invocation, then persists if asked
pub struct Aggregator<'a, T: ?Sized> {
    transport: &'a T,
}

impl<'a, T: Transport + ?Sized> Aggregator<'a, T> {
    /// Create an aggregator writing to `transport`
    pub fn new(transport: &'a T) -> Self {
        Self { transport }
    }

    /// Batch send, then optional save, then finalize.
    ///
    /// Must only be called once the scheduler has confirmed quiescence.
    pub async fn finalize<S: SnapshotStore + ?Sized>(
        &self,
        message: &InboundMessage,
        session: &Session,
        policy: &SnapshotPolicy,
        store: &S,
    ) -> FinalizeReport {
        let mut batch = OutboundBatch::answering(message);
        batch.items = session.outbox().take();
        let items = batch.items.len();

        let status = match self.transport.send(&batch).await {
            Ok(()) => {
                debug!(worker = %batch.worker_id, items, "batch sent");
                StatusCode::Ok
            }
            Err(err) => {
                error!(worker = %batch.worker_id, error = %err, "batch send failed");
                StatusCode::BadGateway
            }
        };

        let save = if session.save_requested() {
            match policy.persist(store, session).await {
                Ok(bytes) => {
                    info!(worker = %session.worker_id(), bytes, "state saved");
                    SaveOutcome::Saved
                }
                Err(err) => {
                    warn!(worker = %session.worker_id(), error = %err, "state save failed");
                    SaveOutcome::Failed
                }
            }
        } else {
            SaveOutcome::NotRequested
        };

        FinalizeReport {
            status,
            items,
            save,
        }
    }
}
