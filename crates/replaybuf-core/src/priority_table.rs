//! In-memory prioritized table with a minimal rate limiter.
//!
//! Items are drawn with probability proportional to priority (uniformly when
//! every priority is zero), with replacement. Sampling blocks until the table
//! holds at least `min_size_to_sample` items or the caller's timeout elapses.

use crate::status::{Result, Status};
use crate::table::{SampledItem, Table, TableItem};
use async_trait::async_trait;
use rand::Rng;
use replaybuf_proto::{KeyWithPriority, TableInfo};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Tuning knobs for a `PriorityTable`.
#[derive(Debug, Clone, Copy)]
pub struct PriorityTableOptions {
    /// Oldest items are evicted once the table grows past this.
    pub max_size: usize,
    /// Sampling blocks until at least this many items are present.
    pub min_size_to_sample: usize,
    /// Batch size used when the client asks for auto-selection.
    pub default_flexible_batch_size: i32,
}

impl Default for PriorityTableOptions {
    fn default() -> Self {
        Self {
            max_size: 1_000_000,
            min_size_to_sample: 1,
            default_flexible_batch_size: 64,
        }
    }
}

struct TableEntry {
    item: Arc<TableItem>,
    priority: f64,
    times_sampled: i32,
}

#[derive(Default)]
struct TableState {
    entries: HashMap<u64, TableEntry>,
    /// Insertion order for FIFO eviction. May hold stale keys after deletes.
    insertion_order: VecDeque<u64>,
    closed: bool,
}

impl TableState {
    fn sampleable(&self, min_size_to_sample: usize) -> bool {
        !self.entries.is_empty() && self.entries.len() >= min_size_to_sample
    }
}

/// In-memory `Table` implementation used by the server binary and tests.
pub struct PriorityTable {
    name: String,
    options: PriorityTableOptions,
    state: Mutex<TableState>,
    /// Woken whenever the table may have become sampleable or was closed.
    watermark: Notify,
}

impl PriorityTable {
    pub fn new(name: impl Into<String>, options: PriorityTableOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: Mutex::new(TableState::default()),
            watermark: Notify::new(),
        }
    }

    fn draw_batch(
        &self,
        state: &mut TableState,
        max_batch_size: i32,
        rate_limited: bool,
    ) -> Vec<SampledItem> {
        let mut rng = rand::thread_rng();
        let mut samples = Vec::new();

        for _ in 0..max_batch_size.max(0) {
            let table_size = state.entries.len() as i64;
            if table_size == 0 {
                break;
            }

            let total_priority: f64 = state.entries.values().map(|e| e.priority).sum();
            let key = if total_priority > 0.0 {
                let mut target = rng.gen_range(0.0..total_priority);
                let mut chosen = None;
                for (key, entry) in &state.entries {
                    if target < entry.priority {
                        chosen = Some(*key);
                        break;
                    }
                    target -= entry.priority;
                }
                // Floating point slack can leave the walk just past the end.
                chosen.unwrap_or_else(|| *state.entries.keys().next().unwrap())
            } else {
                let index = rng.gen_range(0..state.entries.len());
                *state.entries.keys().nth(index).unwrap()
            };

            let entry = state.entries.get_mut(&key).unwrap();
            entry.times_sampled += 1;
            let probability = if total_priority > 0.0 {
                entry.priority / total_priority
            } else {
                1.0 / table_size as f64
            };

            samples.push(SampledItem {
                item: Arc::clone(&entry.item),
                priority: entry.priority,
                times_sampled: entry.times_sampled,
                probability,
                table_size,
                rate_limited,
            });
        }

        samples
    }
}

#[async_trait]
impl Table for PriorityTable {
    fn name(&self) -> &str {
        &self.name
    }

    async fn insert_or_assign(&self, item: TableItem) -> Result<()> {
        let key = item.item.key;
        let priority = item.item.priority;

        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Status::cancelled(format!(
                "Table {} has been closed",
                self.name
            )));
        }

        let inner = &mut *state;
        match inner.entries.entry(key) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.item = Arc::new(item);
                entry.priority = priority;
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(TableEntry {
                    item: Arc::new(item),
                    priority,
                    times_sampled: 0,
                });
                inner.insertion_order.push_back(key);
            }
        }

        while inner.entries.len() > self.options.max_size {
            let Some(oldest) = inner.insertion_order.pop_front() else {
                break;
            };
            if inner.entries.remove(&oldest).is_some() {
                debug!(table = %self.name, key = oldest, "evicted oldest item");
            }
        }

        drop(state);
        self.watermark.notify_waiters();
        Ok(())
    }

    async fn mutate_items(&self, updates: &[KeyWithPriority], delete_keys: &[u64]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Status::cancelled(format!(
                "Table {} has been closed",
                self.name
            )));
        }

        for update in updates {
            if let Some(entry) = state.entries.get_mut(&update.key) {
                entry.priority = update.priority;
            }
        }
        for key in delete_keys {
            state.entries.remove(key);
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.insertion_order.clear();
        Ok(())
    }

    async fn sample_flexible_batch(
        &self,
        max_batch_size: i32,
        timeout: Option<Duration>,
    ) -> Result<Vec<SampledItem>> {
        // A timeout too large to represent is treated as infinite.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut rate_limited = false;

        loop {
            let mut notified = std::pin::pin!(self.watermark.notified());
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(Status::cancelled(format!(
                        "Table {} has been closed",
                        self.name
                    )));
                }
                if state.sampleable(self.options.min_size_to_sample) {
                    return Ok(self.draw_batch(&mut state, max_batch_size, rate_limited));
                }
                // Register for wakeups before releasing the lock so an insert
                // landing right after the check is not missed.
                notified.as_mut().enable();
            }

            rate_limited = true;
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline
                        || tokio::time::timeout(deadline - now, notified).await.is_err()
                    {
                        return Err(Status::deadline_exceeded(format!(
                            "timed out waiting for table {} to become sampleable",
                            self.name
                        )));
                    }
                }
                None => notified.await,
            }
        }
    }

    fn default_flexible_batch_size(&self) -> i32 {
        self.options.default_flexible_batch_size
    }

    fn info(&self) -> TableInfo {
        let state = self.state.lock().unwrap();
        TableInfo {
            name: self.name.clone(),
            max_size: self.options.max_size as i64,
            current_size: state.entries.len() as i64,
            min_size_to_sample: self.options.min_size_to_sample as i64,
            default_flexible_batch_size: self.options.default_flexible_batch_size,
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.watermark.notify_waiters();
    }

    fn debug_string(&self) -> String {
        let state = self.state.lock().unwrap();
        format!(
            "PriorityTable(name={}, size={}, max_size={})",
            self.name,
            state.entries.len(),
            self.options.max_size
        )
    }
}
