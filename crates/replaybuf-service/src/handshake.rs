//! InitializeConnection: the in-process fast path.
//!
//! A co-located client (same pid, local peer address) receives the heap
//! address of a `Box<Arc<dyn Table>>` and rehydrates its own shared reference
//! from it, bypassing serialization entirely. The server keeps ownership of
//! the holder and reclaims it on every exit path.

use crate::service::ReplayService;
use crate::transport::{StreamContext, StreamReader, StreamWriter, WriteOptions};
use replaybuf_core::{Result, Status, Table};
use replaybuf_proto::{InitializeConnectionRequest, InitializeConnectionResponse};
use std::sync::Arc;
use tracing::debug;

/// Whether a peer address may attempt the in-process handshake.
pub fn is_localhost_or_in_process(peer: &str) -> bool {
    if peer.starts_with("inproc:") || peer.starts_with("unix:") {
        return true;
    }
    let address = peer
        .strip_prefix("ipv4:")
        .or_else(|| peer.strip_prefix("ipv6:"))
        .unwrap_or(peer);
    address.starts_with("127.") || address.starts_with("[::1]") || address.starts_with("localhost")
}

/// Heap-owned holder of a shared table reference whose address is transmitted
/// to a co-located client. Dropping the handle frees the holder; the client
/// is expected to have cloned its own `Arc` out of it first.
pub struct TableHandle {
    ptr: *mut Arc<dyn Table>,
}

// The holder only wraps an `Arc<dyn Table>`, which is Send + Sync.
unsafe impl Send for TableHandle {}

impl TableHandle {
    pub fn new(table: Arc<dyn Table>) -> Self {
        Self {
            ptr: Box::into_raw(Box::new(table)),
        }
    }

    /// Address published to the client.
    pub fn address(&self) -> u64 {
        self.ptr as u64
    }

    /// Rehydrate a shared reference from a published address.
    ///
    /// # Safety
    ///
    /// `address` must come from [`TableHandle::address`] of a handle that is
    /// still alive in this process.
    pub unsafe fn shared_table_from_address(address: u64) -> Arc<dyn Table> {
        let holder = &*(address as *const Arc<dyn Table>);
        Arc::clone(holder)
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.ptr)) };
    }
}

impl ReplayService {
    /// Handle one InitializeConnection stream.
    ///
    /// Non-local peers get OK with no response at all; clients treat the
    /// missing address as "fast path unsupported". A local peer from a
    /// foreign process gets `address = 0` and falls back to regular RPC.
    pub async fn initialize_connection<R, W>(
        &self,
        context: &StreamContext,
        mut requests: R,
        mut responses: W,
    ) -> Result<()>
    where
        R: StreamReader<InitializeConnectionRequest>,
        W: StreamWriter<InitializeConnectionResponse>,
    {
        if !is_localhost_or_in_process(context.peer()) {
            return Ok(());
        }

        let Some(request) = requests
            .recv()
            .await
            .map_err(|_| Status::internal("Failed to read from stream"))?
        else {
            return Err(Status::internal("Failed to read from stream"));
        };

        if request.pid != std::process::id() as i64 {
            // Not co-located; answer with an empty address. The write result
            // is irrelevant because the stream closes OK either way.
            let _ = responses
                .send(
                    InitializeConnectionResponse { address: 0 },
                    WriteOptions::default(),
                )
                .await;
            return Ok(());
        }

        let table = self.table_or_not_found(&request.table_name)?;
        debug!(table = %request.table_name, peer = context.peer(), "in-process handshake");

        // The handle is reclaimed on every path out of this scope; the
        // client copies the shared reference before confirming.
        let handle = TableHandle::new(table);
        responses
            .send(
                InitializeConnectionResponse {
                    address: handle.address(),
                },
                WriteOptions::default(),
            )
            .await
            .map_err(|_| Status::internal("Failed to write to stream."))?;

        let Some(confirmation) = requests
            .recv()
            .await
            .map_err(|_| Status::internal("Failed to read from stream."))?
        else {
            return Err(Status::internal("Failed to read from stream."));
        };

        if !confirmation.ownership_transferred {
            return Err(Status::internal("Received unexpected request"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_classification() {
        assert!(is_localhost_or_in_process("127.0.0.1:4321"));
        assert!(is_localhost_or_in_process("ipv4:127.0.0.1:4321"));
        assert!(is_localhost_or_in_process("[::1]:4321"));
        assert!(is_localhost_or_in_process("ipv6:[::1]:4321"));
        assert!(is_localhost_or_in_process("localhost:8000"));
        assert!(is_localhost_or_in_process("unix:/tmp/replay.sock"));
        assert!(is_localhost_or_in_process("inproc:client"));

        assert!(!is_localhost_or_in_process("10.0.0.7:4321"));
        assert!(!is_localhost_or_in_process("ipv4:192.168.1.4:9000"));
        assert!(!is_localhost_or_in_process("example.com:80"));
    }
}
