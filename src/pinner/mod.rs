//! Per-workflow digest pinning coordinator
//!
//! One [`Pinner`] task per workflow owns the tag → digest mapping and
//! guarantees:
//! - at most one outstanding resolver request per reference (duplicates
//!   join a waiter list and share the outcome),
//! - a digest is persisted before any client sees it,
//! - at most one successful write per reference per workflow,
//! - restart replays the store, so tasks observe identical digests across
//!   runs.

mod backoff;
mod config;
mod core;
mod handle;
mod messages;

pub use config::PinnerConfig;
pub use core::Pinner;
pub use handle::PinnerHandle;
pub use messages::{LookupError, LookupResult, PinMsg, PinnerMetrics};
