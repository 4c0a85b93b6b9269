//! # spice-checkpoint - Pause/Resume Persistence for Graph Execution
//!
//! **Trait-based checkpoint abstractions and a reference implementation** for
//! persisting paused graph runs and restoring them later, potentially across
//! process restarts.
//!
//! ## Overview
//!
//! When a graph run reaches a WAITING state - typically a human-in-the-loop
//! node awaiting user input - the engine captures a [`Checkpoint`]: the full
//! paused message, the node it paused at, the tool-call awaiting a response,
//! and (for pauses inside nested subgraphs) a [`SubgraphCheckpointContext`]
//! stack recording every parent level to unwind on resume.
//!
//! ## Core Types
//!
//! - [`Checkpoint`] - Serializable snapshot of a paused run
//! - [`SubgraphCheckpointContext`] - One parent resume frame per nesting level
//! - [`CheckpointStore`] - Async storage trait (`save` / `get` /
//!   `list_by_run` / `delete_by_run`)
//! - [`InMemoryCheckpointStore`] - Reference implementation for tests and
//!   single-process use; persists encoded blobs like a real backend
//! - [`SerializerProtocol`] - Pluggable wire format stores encode blobs
//!   with ([`JsonSerializer`] by default)
//!
//! ## Quick Start
//!
//! ```rust
//! use spice_checkpoint::{Checkpoint, CheckpointStore, InMemoryCheckpointStore};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryCheckpointStore::new();
//!
//! let checkpoint = Checkpoint::new("run-1", "my-graph", "approval", json!({}));
//! store.save(&checkpoint).await?;
//!
//! // The resume path always takes the latest checkpoint of a run.
//! let latest = store.latest_for_run("run-1").await?.unwrap();
//! assert_eq!(latest.current_node_id, "approval");
//!
//! // After the run completes, its checkpoints are removed.
//! store.delete_by_run("run-1").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Production Backends
//!
//! [`InMemoryCheckpointStore`] loses data on restart. For durability,
//! implement [`CheckpointStore`] over PostgreSQL, SQLite, Redis, or object
//! storage; the engine only depends on the trait.

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod store;

pub use checkpoint::{Checkpoint, CheckpointId, SubgraphCheckpointContext};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointStore;
pub use serializer::{JsonSerializer, SerializerProtocol};
pub use store::CheckpointStore;
