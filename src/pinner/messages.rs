//! Message types for the pinner actor

use thiserror::Error;
use tokio::sync::oneshot;

use crate::domain::{Digest, ImageRef};
use crate::resolver::ResolveReply;
use crate::store::{PinnedRow, StoreError};

/// How a single lookup ends
pub type LookupResult = Result<Digest, LookupError>;

/// Errors surfaced to a lookup client
///
/// Every variant except [`LookupError::Terminal`] is transient: the same
/// reference may simply be requested again.
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    #[error("resolver failed: {0}")]
    Resolver(String),

    #[error("timed out waiting for resolver")]
    Timeout,

    #[error("failed to persist digest: {0}")]
    Store(String),

    #[error("digest pinning unavailable: {0}")]
    Terminal(String),

    #[error("pinner channel closed")]
    ChannelClosed,
}

impl LookupError {
    /// Sticky failures mean the pinner will never recover this run
    pub fn is_terminal(&self) -> bool {
        matches!(self, LookupError::Terminal(_))
    }

    /// Check if retrying the same lookup can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LookupError::Resolver(_) | LookupError::Timeout | LookupError::Store(_) => true,
            LookupError::Terminal(_) | LookupError::ChannelClosed => false,
        }
    }
}

/// Everything the pinner's inbox can receive
///
/// Clients, resolver replies, store completions, and the pinner's own
/// scheduled timers all land here, so they interleave in one total order.
#[derive(Debug)]
pub enum PinMsg {
    /// Client lookup; answered with exactly one [`LookupResult`]
    Lookup {
        reference: ImageRef,
        reply: oneshot::Sender<LookupResult>,
    },

    /// A reply from the external resolver
    Resolver(ResolveReply),

    /// Self-imposed deadline for an outstanding resolver request (internal)
    ///
    /// Carries the attempt epoch of the entry it was armed for; a stale
    /// timer from an evicted attempt must not clip a newer one.
    ResolveTimeout { reference: ImageRef, epoch: u64 },

    /// Scheduled backpressure re-send (internal)
    Resend { reference: ImageRef, epoch: u64 },

    /// Restart-time cache load finished (internal)
    LoadCompleted {
        result: Result<Vec<PinnedRow>, StoreError>,
    },

    /// A digest write finished (internal)
    StoreCompleted {
        reference: ImageRef,
        digest: Digest,
        result: Result<(), StoreError>,
    },

    /// Get current metrics
    GetMetrics { reply: oneshot::Sender<PinnerMetrics> },

    /// Stop the pinner
    Shutdown,
}

/// Pinner metrics for observability
#[derive(Debug, Clone, Default)]
pub struct PinnerMetrics {
    pub resolved_entries: usize,
    pub in_flight_references: usize,
    pub buffered_lookups: usize,
    pub messages_received: u64,
    pub cache_hits: u64,
    pub resolver_requests_sent: u64,
    pub resolver_timeouts: u64,
    pub backpressure_retries: u64,
    pub store_writes: u64,
    pub store_failures: u64,
}
