// replaybuf-proto - wire message definitions for the replay service
//
// The messages are written by hand with prost derives rather than generated
// from .proto files at build time. Chunk payloads are `bytes::Bytes` so a
// message clone shares the underlying buffer instead of copying it.

use bytes::Bytes;

/// Sentinel for `SampleStreamRequest::flexible_batch_size` that asks the
/// server to use the table's default batch size. Matches the client sampler.
pub const AUTO_SELECT_BATCH_SIZE: i32 = -1;

/// Range of steps covered by a chunk within its episode.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct SequenceRange {
    #[prost(int32, tag = "1")]
    pub start: i32,
    #[prost(int32, tag = "2")]
    pub end: i32,
}

/// Immutable compressed trajectory fragment. Identity is `chunk_key`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChunkData {
    #[prost(uint64, tag = "1")]
    pub chunk_key: u64,
    #[prost(message, optional, tag = "2")]
    pub sequence_range: Option<SequenceRange>,
    /// Compressed payload. Shared, not copied, when the message is cloned.
    #[prost(bytes = "bytes", tag = "3")]
    pub data: Bytes,
    #[prost(int64, tag = "4")]
    pub data_uncompressed_size: i64,
}

/// A slice of a chunk referenced by one column of a trajectory.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ChunkSlice {
    #[prost(uint64, tag = "1")]
    pub chunk_key: u64,
    #[prost(int32, tag = "2")]
    pub offset: i32,
    #[prost(int32, tag = "3")]
    pub length: i32,
    #[prost(int32, tag = "4")]
    pub index: i32,
}

/// One column of a flattened trajectory.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrajectoryColumn {
    #[prost(message, repeated, tag = "1")]
    pub chunk_slices: Vec<ChunkSlice>,
    #[prost(bool, tag = "2")]
    pub squeeze: bool,
}

/// Column-major description of the data an item spans.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlatTrajectory {
    #[prost(message, repeated, tag = "1")]
    pub columns: Vec<TrajectoryColumn>,
}

impl FlatTrajectory {
    /// Chunk keys referenced by the trajectory, deduplicated, in the order
    /// they first appear.
    pub fn chunk_keys(&self) -> Vec<u64> {
        let mut seen = std::collections::HashSet::new();
        let mut keys = Vec::new();
        for column in &self.columns {
            for slice in &column.chunk_slices {
                if seen.insert(slice.chunk_key) {
                    keys.push(slice.chunk_key);
                }
            }
        }
        keys
    }
}

/// The unit of sampling: a keyed reference into one or more chunks.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrioritizedItem {
    #[prost(uint64, tag = "1")]
    pub key: u64,
    #[prost(string, tag = "2")]
    pub table: String,
    #[prost(message, optional, tag = "3")]
    pub flat_trajectory: Option<FlatTrajectory>,
    #[prost(double, tag = "4")]
    pub priority: f64,
    #[prost(int32, tag = "5")]
    pub times_sampled: i32,
}

/// Priority update for an existing item.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct KeyWithPriority {
    #[prost(uint64, tag = "1")]
    pub key: u64,
    #[prost(double, tag = "2")]
    pub priority: f64,
}

/// Snapshot of one table, as reported by `ServerInfo`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TableInfo {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, tag = "2")]
    pub max_size: i64,
    #[prost(int64, tag = "3")]
    pub current_size: i64,
    #[prost(int64, tag = "4")]
    pub min_size_to_sample: i64,
    #[prost(int32, tag = "5")]
    pub default_flexible_batch_size: i32,
}

/// 128-bit value split into two words for the wire.
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Uint128 {
    #[prost(uint64, tag = "1")]
    pub high: u64,
    #[prost(uint64, tag = "2")]
    pub low: u64,
}

impl Uint128 {
    pub fn from_u128(value: u128) -> Self {
        Self {
            high: (value >> 64) as u64,
            low: value as u64,
        }
    }

    pub fn to_u128(self) -> u128 {
        ((self.high as u128) << 64) | self.low as u128
    }
}

// --- InsertStream ---

/// Item payload of an insert request: the item itself plus the stream-local
/// chunk retention set and the confirmation flag.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ItemInsertion {
    #[prost(message, optional, tag = "1")]
    pub item: Option<PrioritizedItem>,
    /// Chunk keys the stream must keep for later items. Everything else held
    /// for this stream is released once the item is processed.
    #[prost(uint64, repeated, tag = "2")]
    pub keep_chunk_keys: Vec<u64>,
    #[prost(bool, tag = "3")]
    pub send_confirmation: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InsertStreamRequest {
    #[prost(message, repeated, tag = "1")]
    pub chunks: Vec<ChunkData>,
    #[prost(message, optional, tag = "2")]
    pub item: Option<ItemInsertion>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InsertStreamResponse {
    /// Keys of items whose insertion is being confirmed.
    #[prost(uint64, repeated, tag = "1")]
    pub keys: Vec<u64>,
}

// --- MutatePriorities / Reset ---

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MutatePrioritiesRequest {
    #[prost(string, tag = "1")]
    pub table: String,
    #[prost(message, repeated, tag = "2")]
    pub updates: Vec<KeyWithPriority>,
    #[prost(uint64, repeated, tag = "3")]
    pub delete_keys: Vec<u64>,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct MutatePrioritiesResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResetRequest {
    #[prost(string, tag = "1")]
    pub table: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ResetResponse {}

// --- SampleStream ---

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleStreamRequest {
    #[prost(string, tag = "1")]
    pub table: String,
    #[prost(int64, tag = "2")]
    pub num_samples: i64,
    /// Positive batch size, or `AUTO_SELECT_BATCH_SIZE` for the table default.
    #[prost(int32, tag = "3")]
    pub flexible_batch_size: i32,
    /// Absent or negative means wait indefinitely on the rate limiter.
    #[prost(int64, optional, tag = "4")]
    pub rate_limiter_timeout_ms: Option<i64>,
}

/// Metadata attached to the first entry of each sampled item.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleInfo {
    #[prost(message, optional, tag = "1")]
    pub item: Option<PrioritizedItem>,
    #[prost(double, tag = "2")]
    pub probability: f64,
    #[prost(int64, tag = "3")]
    pub table_size: i64,
    #[prost(bool, tag = "4")]
    pub rate_limited: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleEntry {
    #[prost(message, optional, tag = "1")]
    pub info: Option<SampleInfo>,
    #[prost(message, repeated, tag = "2")]
    pub data: Vec<ChunkData>,
    /// Set on the entry holding the last chunk of its sample.
    #[prost(bool, tag = "3")]
    pub end_of_sequence: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SampleStreamResponse {
    #[prost(message, repeated, tag = "1")]
    pub entries: Vec<SampleEntry>,
}

// --- Checkpoint / ServerInfo ---

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct CheckpointRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckpointResponse {
    #[prost(string, tag = "1")]
    pub checkpoint_path: String,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ServerInfoRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerInfoResponse {
    #[prost(message, repeated, tag = "1")]
    pub table_info: Vec<TableInfo>,
    /// Identifies one instance of the service; changes on restart.
    #[prost(message, optional, tag = "2")]
    pub tables_state_id: Option<Uint128>,
}

// --- InitializeConnection ---

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitializeConnectionRequest {
    #[prost(int64, tag = "1")]
    pub pid: i64,
    #[prost(string, tag = "2")]
    pub table_name: String,
    #[prost(bool, tag = "3")]
    pub ownership_transferred: bool,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct InitializeConnectionResponse {
    /// Heap address of a shared table handle, or 0 when the caller is not
    /// co-located with the server.
    #[prost(uint64, tag = "1")]
    pub address: u64,
}

// --- TCP framing ---

/// RPCs exposed by the service. Sent as the first frame of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum RpcMethod {
    Unknown = 0,
    Checkpoint = 1,
    InsertStream = 2,
    MutatePriorities = 3,
    Reset = 4,
    SampleStream = 5,
    ServerInfo = 6,
    InitializeConnection = 7,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct RpcHeader {
    #[prost(enumeration = "RpcMethod", tag = "1")]
    pub method: i32,
}

/// Terminal status of an RPC, written as the trailer frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}
