// replaybuf-core - data stores and collaborator contracts
//
// The service layer in replaybuf-service builds on three pieces defined here:
// the deduplicating ChunkStore, the Table contract (with an in-memory
// priority table implementation), and the Checkpointer contract.

pub mod checkpoint;
pub mod chunk_store;
pub mod priority_table;
pub mod status;
pub mod table;

pub use checkpoint::Checkpointer;
pub use chunk_store::{Chunk, ChunkStore};
pub use priority_table::{PriorityTable, PriorityTableOptions};
pub use status::{Result, Status, StatusCode};
pub use table::{SampledItem, Table, TableItem};
