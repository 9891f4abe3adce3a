//! PinnerHandle - client interface for digest lookups

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::domain::{Digest, ImageRef};

use super::messages::{LookupError, PinMsg, PinnerMetrics};

/// Handle for clients to talk to a running [`Pinner`](super::Pinner)
///
/// Cloneable; every task in the workflow holds one. All operations are
/// async and non-blocking.
#[derive(Clone)]
pub struct PinnerHandle {
    tx: mpsc::UnboundedSender<PinMsg>,
}

impl PinnerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PinMsg>) -> Self {
        Self { tx }
    }

    /// Resolve a reference to its pinned digest
    ///
    /// Answered with exactly one outcome: the digest, a transient failure
    /// (retry the same call), or a sticky terminal failure. Concurrent
    /// lookups for the same reference share a single resolution.
    pub async fn lookup(&self, reference: ImageRef) -> Result<Digest, LookupError> {
        debug!(%reference, "PinnerHandle::lookup: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(PinMsg::Lookup {
                reference,
                reply: reply_tx,
            })
            .map_err(|_| LookupError::ChannelClosed)?;

        debug!("PinnerHandle::lookup: waiting for outcome");
        reply_rx.await.map_err(|_| LookupError::ChannelClosed)?
    }

    /// Get current pinner metrics
    pub async fn metrics(&self) -> Result<PinnerMetrics, LookupError> {
        debug!("PinnerHandle::metrics: called");
        let (reply_tx, reply_rx) = oneshot::channel();

        self.tx
            .send(PinMsg::GetMetrics { reply: reply_tx })
            .map_err(|_| LookupError::ChannelClosed)?;

        reply_rx.await.map_err(|_| LookupError::ChannelClosed)
    }

    /// Ask the pinner to stop
    ///
    /// Fire-and-forget; pending waiters are dropped with the task.
    pub fn shutdown(&self) {
        debug!("PinnerHandle::shutdown: called");
        let _ = self.tx.send(PinMsg::Shutdown);
    }
}
