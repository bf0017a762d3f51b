//! InsertStream: streaming ingest of chunks and items.
//!
//! A dedicated reader task drains the wire into a one-slot queue so the
//! socket keeps moving while the worker decodes chunks and inserts items.
//! Chunks survive across requests of one stream only while they are listed in
//! the most recent item's `keep_chunk_keys` set.

use crate::service::ReplayService;
use crate::transport::{StreamReader, StreamWriter, WriteOptions};
use replaybuf_core::{Chunk, Result, Status, Table, TableItem};
use replaybuf_proto::{InsertStreamRequest, InsertStreamResponse};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Aborts the wrapped task when dropped, closing the read-ahead queue on
/// every exit path of the worker.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ReplayService {
    /// Handle one InsertStream connection until the client half-closes.
    pub async fn insert_stream<R, W>(&self, requests: R, mut responses: W) -> Result<()>
    where
        R: StreamReader<InsertStreamRequest> + 'static,
        W: StreamWriter<InsertStreamResponse>,
    {
        // One-slot queue: the reader stays at most one request ahead of the
        // worker. Dropping either end closes the queue for the other.
        let (queue_tx, mut queue_rx) = mpsc::channel::<InsertStreamRequest>(1);
        let reader = tokio::spawn(async move {
            let mut requests = requests;
            loop {
                match requests.recv().await {
                    Ok(Some(request)) => {
                        if queue_tx.send(request).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        });
        let _reader_guard = AbortOnDrop(reader);

        // Chunks held on behalf of this stream, shrunk to the retained set
        // after every item.
        let mut chunks: HashMap<u64, Arc<Chunk>> = HashMap::new();

        while let Some(request) = queue_rx.recv().await {
            self.process_insert_request(request, &mut chunks, &mut responses)
                .await?;
        }

        Ok(())
    }

    async fn process_insert_request<W>(
        &self,
        request: InsertStreamRequest,
        chunks: &mut HashMap<u64, Arc<Chunk>>,
        responses: &mut W,
    ) -> Result<()>
    where
        W: StreamWriter<InsertStreamResponse>,
    {
        for chunk in request.chunks {
            let key = chunk.chunk_key;
            let Some(stored) = self.chunk_store().insert(chunk) else {
                return Err(Status::cancelled("Service has been closed"));
            };
            chunks.insert(key, stored);
        }

        let Some(insertion) = request.item else {
            return Ok(());
        };
        let item = insertion.item.unwrap_or_default();

        let referenced_keys = item
            .flat_trajectory
            .as_ref()
            .map(|trajectory| trajectory.chunk_keys())
            .unwrap_or_default();
        let mut item_chunks = Vec::with_capacity(referenced_keys.len());
        for key in referenced_keys {
            let Some(chunk) = chunks.get(&key) else {
                return Err(Status::internal(format!(
                    "Could not find sequence chunk {}.",
                    key
                )));
            };
            item_chunks.push(Arc::clone(chunk));
        }

        let table = self.table_or_not_found(&item.table)?;
        let item_key = item.key;
        let send_confirmation = insertion.send_confirmation;

        // The item only becomes visible to samplers here, with every chunk
        // already resolved.
        table
            .insert_or_assign(TableItem {
                item,
                chunks: item_chunks,
            })
            .await?;
        debug!(key = item_key, table = %table.name(), "inserted item");

        if send_confirmation {
            responses
                .send(
                    InsertStreamResponse {
                        keys: vec![item_key],
                    },
                    WriteOptions::default(),
                )
                .await
                .map_err(|_| {
                    Status::internal(format!(
                        "Error when sending confirmation that item {} has been successfully inserted/updated.",
                        item_key
                    ))
                })?;
        }

        // Shrink the held set to exactly what the caller asked us to keep.
        let keep_keys: HashSet<u64> = insertion.keep_chunk_keys.iter().copied().collect();
        chunks.retain(|key, _| keep_keys.contains(key));
        assert_eq!(
            chunks.len(),
            keep_keys.len(),
            "Kept less chunks than expected."
        );

        Ok(())
    }
}
