//! Append-only JSONL digest store
//!
//! One `pins.jsonl` file under the store directory; every row is a
//! serialized [`PinnedRow`]. Appends are flushed before the write is
//! acknowledged. A row that fails to deserialize poisons the whole load:
//! restart must not silently drop resolutions.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{DigestStore, PinnedRow, StoreError};

/// File-backed [`DigestStore`]
pub struct JsonlDigestStore {
    store_path: PathBuf,
}

impl JsonlDigestStore {
    /// Create a store rooted at the given directory
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        let path = store_path.into();
        debug!(?path, "JsonlDigestStore::new: called");
        Self { store_path: path }
    }

    /// Path of the pins file
    fn pins_file(&self) -> PathBuf {
        self.store_path.join("pins.jsonl")
    }

    /// Ensure the store directory exists
    async fn ensure_dir(&self) -> Result<(), StoreError> {
        debug!(path = ?self.store_path, "JsonlDigestStore::ensure_dir: called");
        fs::create_dir_all(&self.store_path).await?;
        Ok(())
    }

    /// Every row in the file, all workflows, in write order
    ///
    /// Used by the inspection CLI; [`DigestStore::load`] filters this down
    /// to one workflow.
    pub async fn rows(&self) -> Result<Vec<PinnedRow>, StoreError> {
        debug!("JsonlDigestStore::rows: called");
        let pins_file = self.pins_file();

        if !pins_file.exists() {
            debug!("JsonlDigestStore::rows: pins file does not exist");
            return Ok(vec![]);
        }

        let content = fs::read_to_string(&pins_file).await?;

        let mut rows = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            // Deliberately not filter_map: a corrupt row must fail the load
            // rather than vanish.
            rows.push(serde_json::from_str(line)?);
        }

        debug!(count = rows.len(), "JsonlDigestStore::rows: returning rows");
        Ok(rows)
    }

    /// Distinct workflow ids present in the store, in first-seen order
    pub async fn workflows(&self) -> Result<Vec<String>, StoreError> {
        debug!("JsonlDigestStore::workflows: called");
        let rows = self.rows().await?;

        let mut seen = std::collections::HashSet::new();
        let mut ids = Vec::new();
        for row in rows {
            if seen.insert(row.workflow_id.clone()) {
                ids.push(row.workflow_id);
            }
        }
        Ok(ids)
    }

    /// Remove all rows (for testing)
    pub async fn clear(&self) -> Result<(), StoreError> {
        debug!("JsonlDigestStore::clear: called");
        let pins_file = self.pins_file();

        if pins_file.exists() {
            fs::remove_file(&pins_file).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DigestStore for JsonlDigestStore {
    async fn load(&self, workflow_id: &str) -> Result<Vec<PinnedRow>, StoreError> {
        debug!(%workflow_id, "JsonlDigestStore::load: called");
        let rows = self.rows().await?;
        let rows: Vec<PinnedRow> = rows.into_iter().filter(|r| r.workflow_id == workflow_id).collect();
        debug!(count = rows.len(), "JsonlDigestStore::load: returning rows");
        Ok(rows)
    }

    async fn store(&self, workflow_id: &str, tag: &str, digest: &str) -> Result<(), StoreError> {
        debug!(%workflow_id, %tag, %digest, "JsonlDigestStore::store: called");
        self.ensure_dir().await?;

        let row = PinnedRow::new(workflow_id, tag, digest);
        let line = serde_json::to_string(&row)? + "\n";

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.pins_file())
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(row_id = %row.id, "JsonlDigestStore::store: row written");
        Ok(())
    }
}
