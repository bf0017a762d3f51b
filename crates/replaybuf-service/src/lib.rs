// replaybuf-service - the service layer of the replay server
//
// Mediates between the wire protocol and the internal data stores: streaming
// ingest of chunks and items (InsertStream), prioritized streamed sampling
// (SampleStream), the unary table RPCs, and the in-process handshake that
// hands a co-located client a shared table reference.

mod handshake;
mod insert;
mod sample;
mod service;
pub mod transport;

pub use handshake::{is_localhost_or_in_process, TableHandle};
pub use sample::MAX_SAMPLE_RESPONSE_SIZE_BYTES;
pub use service::ReplayService;
