//! Service state and the unary RPCs.
//!
//! `ReplayService` owns the table registry (read-only after creation), the
//! shared chunk store, the optional checkpointer, and the per-instance
//! `tables_state_id` clients use to detect restarts.

use rand::Rng;
use replaybuf_core::{Checkpointer, ChunkStore, Result, Status, StatusCode, Table};
use replaybuf_proto::{
    CheckpointRequest, CheckpointResponse, MutatePrioritiesRequest, MutatePrioritiesResponse,
    ResetRequest, ResetResponse, ServerInfoRequest, ServerInfoResponse, Uint128,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

pub(crate) fn table_not_found(name: &str) -> Status {
    Status::not_found(format!("Priority table {} was not found", name))
}

struct ServiceInner {
    tables: HashMap<String, Arc<dyn Table>>,
    chunk_store: Arc<ChunkStore>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    tables_state_id: u128,
}

/// The replay service. Cheap to clone; all clones share one instance.
#[derive(Clone)]
pub struct ReplayService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for ReplayService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayService").finish_non_exhaustive()
    }
}

impl ReplayService {
    /// Build a service hosting `tables`, restoring from the checkpointer when
    /// one is configured.
    ///
    /// The load chain is: latest checkpoint, then the fallback checkpoint,
    /// then an empty service. `NotFound` from either load step is expected;
    /// any other error aborts creation.
    pub async fn create(
        tables: Vec<Arc<dyn Table>>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
    ) -> Result<Self> {
        let chunk_store = Arc::new(ChunkStore::new());

        if let Some(checkpointer) = &checkpointer {
            let mut status = checkpointer.load_latest(&chunk_store, &tables).await;
            if matches!(&status, Err(s) if s.code() == StatusCode::NotFound) {
                status = checkpointer
                    .load_fallback_checkpoint(&chunk_store, &tables)
                    .await;
            }
            match status {
                Ok(()) => {}
                Err(s) if s.code() == StatusCode::NotFound => {}
                Err(s) => return Err(s),
            }
        }

        let mut table_map = HashMap::new();
        for table in tables {
            table_map.insert(table.name().to_string(), table);
        }

        let mut rng = rand::thread_rng();
        let tables_state_id = ((rng.gen::<u64>() as u128) << 64) | rng.gen::<u64>() as u128;

        Ok(Self {
            inner: Arc::new(ServiceInner {
                tables: table_map,
                chunk_store,
                checkpointer,
                tables_state_id,
            }),
        })
    }

    pub fn table_by_name(&self, name: &str) -> Option<Arc<dyn Table>> {
        self.inner.tables.get(name).cloned()
    }

    pub(crate) fn table_or_not_found(&self, name: &str) -> Result<Arc<dyn Table>> {
        self.table_by_name(name).ok_or_else(|| table_not_found(name))
    }

    /// The hosted tables. The mapping is immutable after creation.
    pub fn tables(&self) -> &HashMap<String, Arc<dyn Table>> {
        &self.inner.tables
    }

    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.inner.chunk_store
    }

    pub fn tables_state_id(&self) -> u128 {
        self.inner.tables_state_id
    }

    /// Update item priorities and/or delete items from one table.
    pub async fn mutate_priorities(
        &self,
        request: MutatePrioritiesRequest,
    ) -> Result<MutatePrioritiesResponse> {
        let table = self.table_or_not_found(&request.table)?;
        table
            .mutate_items(&request.updates, &request.delete_keys)
            .await?;
        Ok(MutatePrioritiesResponse {})
    }

    /// Drop all items from one table.
    pub async fn reset(&self, request: ResetRequest) -> Result<ResetResponse> {
        let table = self.table_or_not_found(&request.table)?;
        table.reset().await?;
        Ok(ResetResponse {})
    }

    /// Snapshot every table through the configured checkpointer.
    pub async fn checkpoint(&self, _request: CheckpointRequest) -> Result<CheckpointResponse> {
        let Some(checkpointer) = &self.inner.checkpointer else {
            return Err(Status::invalid_argument(
                "no Checkpointer configured for the replay service.",
            ));
        };

        let tables: Vec<Arc<dyn Table>> = self.inner.tables.values().cloned().collect();
        let checkpoint_path = checkpointer.save(&tables, 1).await?;
        info!("Stored checkpoint to {}", checkpoint_path);
        Ok(CheckpointResponse { checkpoint_path })
    }

    /// Per-table info plus the id identifying this service instance.
    pub fn server_info(&self, _request: ServerInfoRequest) -> ServerInfoResponse {
        ServerInfoResponse {
            table_info: self.inner.tables.values().map(|t| t.info()).collect(),
            tables_state_id: Some(Uint128::from_u128(self.inner.tables_state_id)),
        }
    }

    /// Close every table and the chunk store. Active insert streams observe
    /// the refused inserts as `Cancelled`; blocked samplers are woken.
    pub fn close(&self) {
        for table in self.inner.tables.values() {
            table.close();
        }
        self.inner.chunk_store.close();
    }

    pub fn debug_string(&self) -> String {
        let tables = self
            .inner
            .tables
            .values()
            .map(|t| t.debug_string())
            .collect::<Vec<_>>()
            .join(", ");
        let checkpointer = self
            .inner
            .checkpointer
            .as_ref()
            .map(|c| c.debug_string())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "ReplayService(tables=[{}], checkpointer={})",
            tables, checkpointer
        )
    }
}
