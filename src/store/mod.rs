//! Durable digest storage
//!
//! The pinner persists every resolution before publishing it, and replays
//! the stored rows on workflow restart. The store is addressed per
//! workflow id; rows for different workflows never collide. Uniqueness is
//! not required of the store: a failed-then-retried write may leave
//! duplicate rows for a tag, and rehydration resolves those last-write-wins.

mod jsonl;

pub use jsonl::JsonlDigestStore;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from the durable store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed store row: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One persisted resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinnedRow {
    /// Unique row ID
    pub id: String,
    /// Owning workflow
    pub workflow_id: String,
    /// Canonical image reference, e.g. `ubuntu:latest`
    pub tag: String,
    /// Canonical digest, e.g. `sha256:a1b2…`
    pub digest: String,
    /// Unix timestamp when written
    pub created_at: i64,
}

/// Current Unix timestamp in seconds
fn now_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl PinnedRow {
    pub fn new(workflow_id: impl Into<String>, tag: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            workflow_id: workflow_id.into(),
            tag: tag.into(),
            digest: digest.into(),
            created_at: now_timestamp(),
        }
    }
}

/// The two operations the pinner needs from durable storage
///
/// `load` is called once, on restart; `store` once per successful
/// resolution. Both are async; the pinner routes their completions through
/// its inbox and stays responsive while they run.
#[async_trait]
pub trait DigestStore: Send + Sync {
    /// All rows stored under `workflow_id`, in write order
    async fn load(&self, workflow_id: &str) -> Result<Vec<PinnedRow>, StoreError>;

    /// Append one resolution for `workflow_id`
    async fn store(&self, workflow_id: &str, tag: &str, digest: &str) -> Result<(), StoreError>;
}
