//! Wire format for persisted checkpoints
//!
//! Stores keep checkpoints as opaque byte blobs; [`SerializerProtocol`]
//! decides the format. The contract is stricter than "any serde format":
//! a checkpoint carries heterogeneous JSON values (the paused message, the
//! pending tool-call), so the format must be self-describing, must tolerate
//! unknown fields on decode, and must round-trip an empty `subgraph_stack`
//! rather than dropping it.
//!
//! [`JsonSerializer`] is the default and the only format shipped here;
//! implement the trait to layer compression or encryption on top of it.

use crate::checkpoint::Checkpoint;
use crate::error::Result;

/// Byte format used by stores that persist checkpoints
pub trait SerializerProtocol: Send + Sync {
    /// Stable format name, recorded alongside stored blobs
    fn format(&self) -> &'static str;

    /// Encode a checkpoint to bytes
    fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>>;

    /// Decode a checkpoint from bytes
    fn decode(&self, data: &[u8]) -> Result<Checkpoint>;
}

/// Self-describing JSON format (default)
///
/// Field order is irrelevant and unknown fields are tolerated on decode,
/// so checkpoints written by newer code remain readable.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn format(&self) -> &'static str {
        "json"
    }

    fn encode(&self, checkpoint: &Checkpoint) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(checkpoint)?)
    }

    fn decode(&self, data: &[u8]) -> Result<Checkpoint> {
        Ok(serde_json::from_slice(data)?)
    }
}
