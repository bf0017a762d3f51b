//! Content-addressed, reference-counted store of immutable trajectory chunks.
//!
//! The store itself only holds weak references. A chunk stays alive for as
//! long as some item, insert stream or in-flight sample holds the `Arc`; when
//! the last strong reference drops the slot becomes reclaimable.

use replaybuf_proto::ChunkData;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Dead weak entries are swept once this many inserts have accumulated.
const SWEEP_INTERVAL: usize = 1024;

/// An immutable chunk of compressed trajectory data.
#[derive(Debug)]
pub struct Chunk {
    data: ChunkData,
}

impl Chunk {
    pub fn new(data: ChunkData) -> Self {
        Self { data }
    }

    pub fn key(&self) -> u64 {
        self.data.chunk_key
    }

    pub fn data(&self) -> &ChunkData {
        &self.data
    }

    /// Size of the compressed payload in bytes.
    pub fn data_byte_size(&self) -> usize {
        self.data.data.len()
    }
}

#[derive(Default)]
struct Inner {
    chunks: HashMap<u64, Weak<Chunk>>,
    closed: bool,
    inserts_since_sweep: usize,
}

/// Thread-safe mapping `chunk_key -> shared(Chunk)`.
///
/// Insertion is idempotent on key: inserting a chunk whose key is already
/// live returns the existing shared chunk and discards the new payload.
#[derive(Default)]
pub struct ChunkStore {
    inner: Mutex<Inner>,
}

impl ChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a chunk, returning a shared reference to it.
    ///
    /// Returns `None` once the store is closed. In-flight shared chunks stay
    /// valid after close until their last reference drops.
    pub fn insert(&self, data: ChunkData) -> Option<Arc<Chunk>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return None;
        }

        inner.inserts_since_sweep += 1;
        if inner.inserts_since_sweep >= SWEEP_INTERVAL {
            inner.chunks.retain(|_, weak| weak.strong_count() > 0);
            inner.inserts_since_sweep = 0;
        }

        match inner.chunks.entry(data.chunk_key) {
            Entry::Occupied(mut entry) => {
                if let Some(existing) = entry.get().upgrade() {
                    return Some(existing);
                }
                let chunk = Arc::new(Chunk::new(data));
                entry.insert(Arc::downgrade(&chunk));
                Some(chunk)
            }
            Entry::Vacant(entry) => {
                let chunk = Arc::new(Chunk::new(data));
                entry.insert(Arc::downgrade(&chunk));
                Some(chunk)
            }
        }
    }

    /// Look up a live chunk by key.
    pub fn get(&self, key: u64) -> Option<Arc<Chunk>> {
        let inner = self.inner.lock().unwrap();
        inner.chunks.get(&key).and_then(Weak::upgrade)
    }

    /// Number of chunks currently kept alive by at least one strong holder.
    pub fn live_chunks(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .chunks
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Refuse all further insertions.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn chunk_data(key: u64, payload: &'static [u8]) -> ChunkData {
        ChunkData {
            chunk_key: key,
            sequence_range: None,
            data: Bytes::from_static(payload),
            data_uncompressed_size: payload.len() as i64,
        }
    }

    #[test]
    fn test_insert_returns_shared_chunk() {
        let store = ChunkStore::new();
        let chunk = store.insert(chunk_data(1, b"a")).unwrap();
        assert_eq!(chunk.key(), 1);
        assert_eq!(chunk.data_byte_size(), 1);
    }

    #[test]
    fn test_insert_deduplicates_on_key() {
        let store = ChunkStore::new();
        let first = store.insert(chunk_data(7, b"first")).unwrap();
        let second = store.insert(chunk_data(7, b"second")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // The duplicate payload was discarded.
        assert_eq!(second.data().data.as_ref(), b"first");
        assert_eq!(store.live_chunks(), 1);
    }

    #[test]
    fn test_slot_reclaimed_after_last_reference_drops() {
        let store = ChunkStore::new();
        let chunk = store.insert(chunk_data(3, b"x")).unwrap();
        assert!(store.get(3).is_some());
        drop(chunk);
        assert!(store.get(3).is_none());

        // The key can be reused with fresh content.
        let replacement = store.insert(chunk_data(3, b"y")).unwrap();
        assert_eq!(replacement.data().data.as_ref(), b"y");
    }

    #[test]
    fn test_insert_after_close_fails() {
        let store = ChunkStore::new();
        let held = store.insert(chunk_data(1, b"a")).unwrap();
        store.close();
        assert!(store.insert(chunk_data(2, b"b")).is_none());
        // Chunks held before close stay readable.
        assert_eq!(held.key(), 1);
    }

    #[test]
    fn test_concurrent_inserts_share_one_chunk() {
        let store = Arc::new(ChunkStore::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store.insert(chunk_data(42, b"shared")).unwrap()
            }));
        }
        let chunks: Vec<Arc<Chunk>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for chunk in &chunks[1..] {
            assert!(Arc::ptr_eq(&chunks[0], chunk));
        }
    }
}
