//! In-memory checkpoint store for development and testing
//!
//! [`InMemoryCheckpointStore`] is the reference [`CheckpointStore`]
//! implementation. Like a database- or Redis-backed store it persists
//! checkpoints as encoded byte blobs through a [`SerializerProtocol`]
//! (JSON by default), so every save/load exercises the same wire format a
//! production backend would - a checkpoint that cannot survive encoding
//! fails at save time, not at resume time. Blobs live in a `HashMap` keyed
//! by `run_id`, guarded by an async `RwLock`, and are lost on restart.
//!
//! # When to Use
//!
//! - Unit and integration tests (use [`clear`](InMemoryCheckpointStore::clear)
//!   between tests)
//! - Local development without a database
//! - Single-process applications where durability does not matter
//!
//! For production, implement [`CheckpointStore`] over a persistent backend;
//! application code stays the same.
//!
//! # Concurrency
//!
//! Reads take a shared lock, writes an exclusive one. Clones share the same
//! underlying storage (`Arc`), so a store can be handed to the runner and a
//! test harness simultaneously.
//!
//! # Example
//!
//! ```rust
//! use spice_checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryCheckpointStore::new();
//!
//! let checkpoint = Checkpoint::new("run-1", "graph", "hitl", json!({}));
//! store.save(&checkpoint).await?;
//!
//! let latest = store.latest_for_run("run-1").await?;
//! assert_eq!(latest.unwrap().id, checkpoint.id);
//! # Ok(())
//! # }
//! ```

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use crate::serializer::{JsonSerializer, SerializerProtocol};
use crate::store::CheckpointStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// One encoded checkpoint; id and timestamp are denormalized so lookups
/// and latest-wins ordering do not decode every blob
#[derive(Debug, Clone)]
struct StoredBlob {
    id: String,
    timestamp: DateTime<Utc>,
    bytes: Vec<u8>,
}

/// Thread-safe blob storage, keyed by run ID
type BlobStorage = Arc<RwLock<HashMap<String, Vec<StoredBlob>>>>;

/// In-memory checkpoint store implementation
#[derive(Clone)]
pub struct InMemoryCheckpointStore {
    storage: BlobStorage,
    serializer: Arc<dyn SerializerProtocol>,
}

impl std::fmt::Debug for InMemoryCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCheckpointStore")
            .field("format", &self.serializer.format())
            .finish()
    }
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCheckpointStore {
    /// Create an empty store using the JSON wire format
    pub fn new() -> Self {
        Self::with_serializer(Arc::new(JsonSerializer::new()))
    }

    /// Create an empty store over a custom wire format
    pub fn with_serializer(serializer: Arc<dyn SerializerProtocol>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(HashMap::new())),
            serializer,
        }
    }

    /// Number of runs currently tracked
    pub async fn run_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Total number of checkpoints across all runs
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .map(|blobs| blobs.len())
            .sum()
    }

    /// Remove every checkpoint (useful between tests)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let blob = StoredBlob {
            id: checkpoint.id.clone(),
            timestamp: checkpoint.timestamp,
            bytes: self.serializer.encode(checkpoint)?,
        };

        let mut storage = self.storage.write().await;
        let blobs = storage.entry(checkpoint.run_id.clone()).or_default();

        // Saving an existing ID replaces it (response write-back path).
        if let Some(existing) = blobs.iter_mut().find(|b| b.id == blob.id) {
            *existing = blob;
        } else {
            blobs.push(blob);
        }

        tracing::debug!(
            checkpoint_id = %checkpoint.id,
            run_id = %checkpoint.run_id,
            node_id = %checkpoint.current_node_id,
            format = self.serializer.format(),
            "checkpoint saved"
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Checkpoint>> {
        let storage = self.storage.read().await;
        storage
            .values()
            .flatten()
            .find(|blob| blob.id == id)
            .map(|blob| self.serializer.decode(&blob.bytes))
            .transpose()
    }

    async fn list_by_run(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let storage = self.storage.read().await;
        storage
            .get(run_id)
            .into_iter()
            .flatten()
            .map(|blob| self.serializer.decode(&blob.bytes))
            .collect()
    }

    async fn delete_by_run(&self, run_id: &str) -> Result<()> {
        let mut storage = self.storage.write().await;
        storage.remove(run_id);
        tracing::debug!(run_id = %run_id, "checkpoints deleted");
        Ok(())
    }

    async fn latest_for_run(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let storage = self.storage.read().await;
        storage
            .get(run_id)
            .and_then(|blobs| blobs.iter().max_by_key(|blob| blob.timestamp))
            .map(|blob| self.serializer.decode(&blob.bytes))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_and_get_round_trips_through_wire_format() {
        let store = InMemoryCheckpointStore::new();
        let checkpoint = Checkpoint::new("run-1", "g", "n", json!({"k": "v"}))
            .with_pending_tool_call(json!({"id": "tc-1", "name": "request_user_input"}));

        store.save(&checkpoint).await.unwrap();

        let loaded = store.get(&checkpoint.id).await.unwrap().unwrap();
        assert_eq!(loaded.run_id, "run-1");
        assert_eq!(loaded.message, json!({"k": "v"}));
        assert_eq!(loaded.pending_tool_call, checkpoint.pending_tool_call);
        assert_eq!(loaded.timestamp, checkpoint.timestamp);
    }

    #[tokio::test]
    async fn test_latest_for_run_wins_by_timestamp() {
        let store = InMemoryCheckpointStore::new();

        let mut older = Checkpoint::new("run-1", "g", "first", json!({}));
        older.timestamp = older.timestamp - Duration::minutes(10);
        let newer = Checkpoint::new("run-1", "g", "second", json!({}));

        // Insert newest first to prove ordering comes from timestamps,
        // not insertion order.
        store.save(&newer).await.unwrap();
        store.save(&older).await.unwrap();

        let latest = store.latest_for_run("run-1").await.unwrap().unwrap();
        assert_eq!(latest.current_node_id, "second");
    }

    #[tokio::test]
    async fn test_save_same_id_replaces() {
        let store = InMemoryCheckpointStore::new();
        let mut checkpoint = Checkpoint::new("run-1", "g", "n", json!({}));
        store.save(&checkpoint).await.unwrap();

        checkpoint.record_response(json!({"name": "user_response"}));
        store.save(&checkpoint).await.unwrap();

        assert_eq!(store.checkpoint_count().await, 1);
        let loaded = store.get(&checkpoint.id).await.unwrap().unwrap();
        assert!(loaded.response_tool_call.is_some());
    }

    #[tokio::test]
    async fn test_delete_by_run() {
        let store = InMemoryCheckpointStore::new();
        store
            .save(&Checkpoint::new("run-1", "g", "a", json!({})))
            .await
            .unwrap();
        store
            .save(&Checkpoint::new("run-1", "g", "b", json!({})))
            .await
            .unwrap();
        store
            .save(&Checkpoint::new("run-2", "g", "c", json!({})))
            .await
            .unwrap();

        store.delete_by_run("run-1").await.unwrap();

        assert!(store.list_by_run("run-1").await.unwrap().is_empty());
        assert_eq!(store.list_by_run("run-2").await.unwrap().len(), 1);
        assert_eq!(store.run_count().await, 1);
    }

    #[tokio::test]
    async fn test_missing_run_is_empty_not_error() {
        let store = InMemoryCheckpointStore::new();
        assert!(store.list_by_run("nope").await.unwrap().is_empty());
        assert!(store.latest_for_run("nope").await.unwrap().is_none());
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_explicit_serializer_is_used() {
        let serializer = Arc::new(JsonSerializer::new());
        let store = InMemoryCheckpointStore::with_serializer(serializer);
        assert_eq!(format!("{:?}", store), r#"InMemoryCheckpointStore { format: "json" }"#);

        let checkpoint = Checkpoint::new("run-1", "g", "n", json!({"x": 1}));
        store.save(&checkpoint).await.unwrap();
        let loaded = store.latest_for_run("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.message, json!({"x": 1}));
    }
}
