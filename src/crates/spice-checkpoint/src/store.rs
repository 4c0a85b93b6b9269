//! Extensible checkpoint storage trait for custom backend implementations
//!
//! This module defines the **[`CheckpointStore`]** trait - the abstraction
//! through which the graph runner persists and reloads paused runs. The trait
//! lets downstream projects plug any storage system (PostgreSQL, SQLite,
//! Redis, S3, ...) into the pause/resume machinery.
//!
//! # Overview
//!
//! A store keeps checkpoints grouped by `run_id`. The resume path always asks
//! for "the latest checkpoint of this run"; older checkpoints of the same run
//! are retained for audit until `delete_by_run` removes them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  Resume engine                                  │
//! │  • on WAITING: store.save(checkpoint)           │
//! │  • on resume:  store.list_by_run(run_id)        │
//! │                → pick latest by timestamp       │
//! │  • on terminal: store.delete_by_run(run_id)     │
//! └───────────────────┬─────────────────────────────┘
//!                     │ CheckpointStore trait
//!                     ↓
//! ┌─────────────────────────────────────────────────┐
//! │  Backend (your implementation)                  │
//! │  InMemoryCheckpointStore / Postgres / Redis ... │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Implementing a Custom Backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use spice_checkpoint::{Checkpoint, CheckpointStore, Result};
//!
//! struct PostgresCheckpointStore {
//!     pool: sqlx::PgPool,
//! }
//!
//! #[async_trait]
//! impl CheckpointStore for PostgresCheckpointStore {
//!     async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
//!         let data = serde_json::to_value(checkpoint)?;
//!         sqlx::query!(
//!             "INSERT INTO checkpoints (id, run_id, data) VALUES ($1, $2, $3)
//!              ON CONFLICT (id) DO UPDATE SET data = $3",
//!             checkpoint.id, checkpoint.run_id, data,
//!         )
//!         .execute(&self.pool)
//!         .await
//!         .map_err(|e| spice_checkpoint::CheckpointError::Storage(e.to_string()))?;
//!         Ok(())
//!     }
//!
//!     // ... get / list_by_run / delete_by_run ...
//! }
//! ```
//!
//! # Thread Safety
//!
//! Implementations must be `Send + Sync` and safe under concurrent use; the
//! runner never serializes access on their behalf.

use crate::checkpoint::Checkpoint;
use crate::error::Result;
use async_trait::async_trait;

/// Persistence backend for paused-run checkpoints
///
/// The runner treats the store as a shared collaborator: it never caches
/// checkpoints between calls, and the latest checkpoint by `timestamp` wins
/// when resuming by `run_id`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Fetch a checkpoint by its ID
    async fn get(&self, id: &str) -> Result<Option<Checkpoint>>;

    /// List all checkpoints for a run, oldest first
    async fn list_by_run(&self, run_id: &str) -> Result<Vec<Checkpoint>>;

    /// Delete every checkpoint belonging to a run
    async fn delete_by_run(&self, run_id: &str) -> Result<()>;

    /// Latest checkpoint for a run by `timestamp`, if any
    async fn latest_for_run(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        let checkpoints = self.list_by_run(run_id).await?;
        Ok(checkpoints
            .into_iter()
            .max_by_key(|checkpoint| checkpoint.timestamp))
    }
}
