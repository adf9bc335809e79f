//! Outbound batch delivery
//!
//! The runtime only needs one capability from the transport adapter: deliver
//! a finished batch and report whether that worked.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::error::TransportError;
use super::message::OutboundBatch;

/// Sink for outbound batches
pub trait Transport: Send + Sync {
    /// Deliver one batch; resolves once the send completed
    fn send<'a>(&'a self, batch: &'a OutboundBatch) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// Keeps every batch in memory
#[derive(Debug, Default)]
pub struct CollectingTransport {
    batches: Mutex<Vec<OutboundBatch>>,
}

impl CollectingTransport {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return the collected batches
    pub fn take(&self) -> Vec<OutboundBatch> {
        std::mem::take(&mut *self.batches.lock())
    }

    /// Number of batches collected
    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    /// Whether nothing was collected
    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }
}

impl Transport for CollectingTransport {
    fn send<'a>(&'a self, batch: &'a OutboundBatch) -> BoxFuture<'a, Result<(), TransportError>> {
        self.batches.lock().push(batch.clone());
        futures::future::ready(Ok(())).boxed()
    }
}

/// Forwards batches to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundBatch>,
}

impl ChannelTransport {
    /// Create a transport and the receiver that observes it
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send<'a>(&'a self, batch: &'a OutboundBatch) -> BoxFuture<'a, Result<(), TransportError>> {
        let result = self
            .tx
            .send(batch.clone())
            .map_err(|_| TransportError::Closed);
        futures::future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::message::WorkerId;

    fn batch() -> OutboundBatch {
        OutboundBatch {
            worker_id: WorkerId::new("W1").unwrap(),
            counter: 1,
            items: Vec::new(),
            client_id: None,
            server_id: None,
        }
    }

    #[tokio::test]
    async fn test_channel_transport_reports_closed() {
        let (transport, mut rx) = ChannelTransport::new();
        transport.send(&batch()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().counter, 1);

        drop(rx);
        assert!(matches!(
            transport.send(&batch()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_collecting_transport() {
        let transport = CollectingTransport::new();
        transport.send(&batch()).await.unwrap();
        assert_eq!(transport.len(), 1);
        assert_eq!(transport.take().len(), 1);
        assert!(transport.is_empty());
    }
}
