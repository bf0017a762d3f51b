//! The table contract consumed by the service layer.
//!
//! A table is a named prioritized collection of items with its own sampling
//! distribution and rate limiter. The service only depends on this trait;
//! `PriorityTable` is the in-memory implementation shipped with the server.

use crate::chunk_store::Chunk;
use crate::status::Result;
use async_trait::async_trait;
use replaybuf_proto::{KeyWithPriority, PrioritizedItem, TableInfo};
use std::sync::Arc;
use std::time::Duration;

/// An item together with the shared chunks its trajectory references.
///
/// Holding a `TableItem` keeps every referenced chunk alive, which is what
/// makes the item resolvable for samplers.
#[derive(Debug)]
pub struct TableItem {
    pub item: PrioritizedItem,
    pub chunks: Vec<Arc<Chunk>>,
}

/// One drawn sample: a shared reference to the item record plus the sampling
/// metadata captured at draw time.
#[derive(Debug, Clone)]
pub struct SampledItem {
    pub item: Arc<TableItem>,
    pub priority: f64,
    pub times_sampled: i32,
    pub probability: f64,
    pub table_size: i64,
    pub rate_limited: bool,
}

/// A named prioritized item collection.
///
/// Implementations must be safe under concurrent insert, mutate, sample and
/// reset. `info()` is expected to produce a consistent snapshot on its own.
#[async_trait]
pub trait Table: Send + Sync {
    fn name(&self) -> &str;

    /// Insert a new item, or reassign the priority of an existing key.
    async fn insert_or_assign(&self, item: TableItem) -> Result<()>;

    /// Apply priority updates and deletions in one call.
    async fn mutate_items(&self, updates: &[KeyWithPriority], delete_keys: &[u64]) -> Result<()>;

    /// Drop all items.
    async fn reset(&self) -> Result<()>;

    /// Draw up to `max_batch_size` samples, waiting on the rate limiter for
    /// at most `timeout` (`None` waits indefinitely). A timeout surfaces as
    /// `DeadlineExceeded`.
    async fn sample_flexible_batch(
        &self,
        max_batch_size: i32,
        timeout: Option<Duration>,
    ) -> Result<Vec<SampledItem>>;

    fn default_flexible_batch_size(&self) -> i32;

    fn info(&self) -> TableInfo;

    /// Unblock waiting samplers and refuse further operations.
    fn close(&self);

    fn debug_string(&self) -> String;
}
