//! Snapshot/restore contract for the service.
//!
//! The serialization format is owned by the implementation; the service only
//! drives the load chain at startup and `save` on the Checkpoint RPC.

use crate::chunk_store::ChunkStore;
use crate::status::Result;
use crate::table::Table;
use async_trait::async_trait;
use std::sync::Arc;

/// Snapshot and restore of chunks plus table contents.
///
/// Both load operations return `NotFound` when no checkpoint exists at their
/// respective location.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Restore the most recent checkpoint into the store and tables.
    async fn load_latest(
        &self,
        chunk_store: &ChunkStore,
        tables: &[Arc<dyn Table>],
    ) -> Result<()>;

    /// Restore a configured fallback checkpoint, typically produced by a
    /// different experiment, when the primary location is empty.
    async fn load_fallback_checkpoint(
        &self,
        chunk_store: &ChunkStore,
        tables: &[Arc<dyn Table>],
    ) -> Result<()>;

    /// Write a snapshot of `tables`, retaining at most `keep` older
    /// snapshots, and return the path of the new checkpoint.
    async fn save(&self, tables: &[Arc<dyn Table>], keep: usize) -> Result<String>;

    fn debug_string(&self) -> String {
        "Checkpointer".to_string()
    }
}
