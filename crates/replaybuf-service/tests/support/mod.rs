//! Shared builders for the service integration tests.

use async_trait::async_trait;
use bytes::Bytes;
use replaybuf_core::{
    Checkpointer, ChunkStore, PriorityTable, PriorityTableOptions, Result, Status, Table,
};
use replaybuf_proto::{
    ChunkData, ChunkSlice, FlatTrajectory, InsertStreamRequest, ItemInsertion, PrioritizedItem,
    TrajectoryColumn,
};
use replaybuf_service::ReplayService;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub fn chunk(key: u64, payload: impl Into<Bytes>) -> ChunkData {
    let data = payload.into();
    let size = data.len() as i64;
    ChunkData {
        chunk_key: key,
        sequence_range: None,
        data,
        data_uncompressed_size: size,
    }
}

pub fn trajectory(chunk_keys: &[u64]) -> FlatTrajectory {
    FlatTrajectory {
        columns: vec![TrajectoryColumn {
            chunk_slices: chunk_keys
                .iter()
                .map(|&chunk_key| ChunkSlice {
                    chunk_key,
                    offset: 0,
                    length: 1,
                    index: 0,
                })
                .collect(),
            squeeze: false,
        }],
    }
}

pub fn item(key: u64, table: &str, chunk_keys: &[u64], priority: f64) -> PrioritizedItem {
    PrioritizedItem {
        key,
        table: table.to_string(),
        flat_trajectory: Some(trajectory(chunk_keys)),
        priority,
        times_sampled: 0,
    }
}

pub fn insert_request(
    chunks: Vec<ChunkData>,
    item: Option<(PrioritizedItem, Vec<u64>, bool)>,
) -> InsertStreamRequest {
    InsertStreamRequest {
        chunks,
        item: item.map(|(item, keep_chunk_keys, send_confirmation)| ItemInsertion {
            item: Some(item),
            keep_chunk_keys,
            send_confirmation,
        }),
    }
}

pub fn priority_table(name: &str) -> Arc<dyn Table> {
    Arc::new(PriorityTable::new(name, PriorityTableOptions::default()))
}

pub async fn service_with_tables(names: &[&str]) -> ReplayService {
    let tables = names.iter().map(|name| priority_table(name)).collect();
    ReplayService::create(tables, None).await.unwrap()
}

/// Checkpointer double with scripted load results.
pub struct ScriptedCheckpointer {
    pub latest: Option<Status>,
    pub fallback: Option<Status>,
    pub save_path: String,
    pub saves: AtomicUsize,
}

impl ScriptedCheckpointer {
    pub fn empty() -> Self {
        Self {
            latest: Some(Status::not_found("no checkpoint")),
            fallback: Some(Status::not_found("no fallback checkpoint")),
            save_path: "/tmp/checkpoints/0".to_string(),
            saves: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Checkpointer for ScriptedCheckpointer {
    async fn load_latest(
        &self,
        _chunk_store: &ChunkStore,
        _tables: &[Arc<dyn Table>],
    ) -> Result<()> {
        match &self.latest {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }

    async fn load_fallback_checkpoint(
        &self,
        _chunk_store: &ChunkStore,
        _tables: &[Arc<dyn Table>],
    ) -> Result<()> {
        match &self.fallback {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }

    async fn save(&self, _tables: &[Arc<dyn Table>], _keep: usize) -> Result<String> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(self.save_path.clone())
    }

    fn debug_string(&self) -> String {
        "ScriptedCheckpointer".to_string()
    }
}
