//! End-to-end tests driving the server through the real TCP frame transport.

use bytes::Bytes;
use prost::Message;
use replaybuf::net::{self, FrameReader, FrameWriter, FRAME_MESSAGE, FRAME_TRAILER};
use replaybuf_core::{PriorityTable, PriorityTableOptions, StatusCode, Table};
use replaybuf_proto::{
    ChunkData, ChunkSlice, FlatTrajectory, InsertStreamRequest, InsertStreamResponse,
    ItemInsertion, PrioritizedItem, RpcHeader, RpcMethod, RpcStatus, SampleStreamRequest,
    SampleStreamResponse, ServerInfoRequest, ServerInfoResponse, TrajectoryColumn,
};
use replaybuf_service::ReplayService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

async fn start_server() -> SocketAddr {
    let tables: Vec<Arc<dyn Table>> = vec![Arc::new(PriorityTable::new(
        "t",
        PriorityTableOptions::default(),
    ))];
    let service = ReplayService::create(tables, None).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        net::serve(service, listener, std::future::pending())
            .await
            .unwrap();
    });
    addr
}

async fn open_rpc(
    addr: SocketAddr,
    method: RpcMethod,
) -> (FrameWriter<OwnedWriteHalf>, FrameReader<OwnedReadHalf>) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut writer = FrameWriter::new(write_half);
    writer
        .write_message(&RpcHeader {
            method: method as i32,
        })
        .await
        .unwrap();
    (writer, FrameReader::new(read_half))
}

/// Read message frames until the trailer, returning (messages, status).
async fn drain_rpc<T: Message + Default>(
    reader: &mut FrameReader<OwnedReadHalf>,
) -> (Vec<T>, RpcStatus) {
    let mut messages = Vec::new();
    loop {
        let (kind, body) = reader.read_frame().await.unwrap().unwrap();
        match kind {
            FRAME_MESSAGE => messages.push(T::decode(body).unwrap()),
            FRAME_TRAILER => return (messages, RpcStatus::decode(body).unwrap()),
            other => panic!("unexpected frame kind {}", other),
        }
    }
}

fn insert_request(key: u64, item_key: u64, payload: &'static [u8]) -> InsertStreamRequest {
    InsertStreamRequest {
        chunks: vec![ChunkData {
            chunk_key: key,
            sequence_range: None,
            data: Bytes::from_static(payload),
            data_uncompressed_size: payload.len() as i64,
        }],
        item: Some(ItemInsertion {
            item: Some(PrioritizedItem {
                key: item_key,
                table: "t".to_string(),
                flat_trajectory: Some(FlatTrajectory {
                    columns: vec![TrajectoryColumn {
                        chunk_slices: vec![ChunkSlice {
                            chunk_key: key,
                            offset: 0,
                            length: 1,
                            index: 0,
                        }],
                        squeeze: false,
                    }],
                }),
                priority: 1.0,
                times_sampled: 0,
            }),
            keep_chunk_keys: vec![],
            send_confirmation: true,
        }),
    }
}

#[tokio::test]
async fn test_insert_sample_and_info_over_tcp() {
    let addr = start_server().await;

    // Insert one item.
    let (mut writer, mut reader) = open_rpc(addr, RpcMethod::InsertStream).await;
    writer
        .write_message(&insert_request(7, 100, b"A"))
        .await
        .unwrap();
    writer.shutdown().await.unwrap();

    let (confirmations, status) = drain_rpc::<InsertStreamResponse>(&mut reader).await;
    assert_eq!(status.code, StatusCode::Ok.as_i32());
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].keys, vec![100]);

    // Sample it back.
    let (mut writer, mut reader) = open_rpc(addr, RpcMethod::SampleStream).await;
    writer
        .write_message(&SampleStreamRequest {
            table: "t".to_string(),
            num_samples: 1,
            flexible_batch_size: 1,
            rate_limiter_timeout_ms: None,
        })
        .await
        .unwrap();
    writer.shutdown().await.unwrap();

    let (frames, status) = drain_rpc::<SampleStreamResponse>(&mut reader).await;
    assert_eq!(status.code, StatusCode::Ok.as_i32());
    assert_eq!(frames.len(), 1);
    let entry = &frames[0].entries[0];
    assert_eq!(entry.info.as_ref().unwrap().item.as_ref().unwrap().key, 100);
    assert_eq!(entry.data[0].data.as_ref(), b"A");
    assert!(entry.end_of_sequence);

    // Server info reports the table and a non-zero state id.
    let (mut writer, mut reader) = open_rpc(addr, RpcMethod::ServerInfo).await;
    writer.write_message(&ServerInfoRequest {}).await.unwrap();

    let (responses, status) = drain_rpc::<ServerInfoResponse>(&mut reader).await;
    assert_eq!(status.code, StatusCode::Ok.as_i32());
    assert_eq!(responses.len(), 1);
    let info = &responses[0];
    assert_eq!(info.table_info.len(), 1);
    assert_eq!(info.table_info[0].name, "t");
    assert_eq!(info.table_info[0].current_size, 1);
    assert_ne!(info.tables_state_id.unwrap().to_u128(), 0);
}

#[tokio::test]
async fn test_missing_table_surfaces_not_found_trailer() {
    let addr = start_server().await;

    let (mut writer, mut reader) = open_rpc(addr, RpcMethod::SampleStream).await;
    writer
        .write_message(&SampleStreamRequest {
            table: "ghost".to_string(),
            num_samples: 1,
            flexible_batch_size: 1,
            rate_limiter_timeout_ms: None,
        })
        .await
        .unwrap();
    writer.shutdown().await.unwrap();

    let (frames, status) = drain_rpc::<SampleStreamResponse>(&mut reader).await;
    assert!(frames.is_empty());
    assert_eq!(status.code, StatusCode::NotFound.as_i32());
    assert!(status.message.contains("Priority table ghost was not found"));
}

#[tokio::test]
async fn test_abortive_disconnect_releases_blocked_sampler() {
    let addr = start_server().await;

    // Park a sampler on the empty table with an infinite rate-limiter wait.
    let stream = TcpStream::connect(addr).await.unwrap();
    stream
        .set_linger(Some(std::time::Duration::from_secs(0)))
        .unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut writer = FrameWriter::new(write_half);
    writer
        .write_message(&RpcHeader {
            method: RpcMethod::SampleStream as i32,
        })
        .await
        .unwrap();
    writer
        .write_message(&SampleStreamRequest {
            table: "t".to_string(),
            num_samples: 1,
            flexible_batch_size: 1,
            rate_limiter_timeout_ms: None,
        })
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // With linger zero, dropping the socket sends a reset instead of a
    // half-close. The server must observe it and release the parked sampler.
    drop(writer);
    drop(read_half);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // Insert an item over a fresh connection.
    let (mut writer, mut reader) = open_rpc(addr, RpcMethod::InsertStream).await;
    writer
        .write_message(&insert_request(7, 100, b"A"))
        .await
        .unwrap();
    writer.shutdown().await.unwrap();
    let (confirmations, status) = drain_rpc::<InsertStreamResponse>(&mut reader).await;
    assert_eq!(status.code, StatusCode::Ok.as_i32());
    assert_eq!(confirmations[0].keys, vec![100]);

    // The abandoned sampler is gone, so nothing else drew the item: this
    // stream sees the very first sample of it.
    let (mut writer, mut reader) = open_rpc(addr, RpcMethod::SampleStream).await;
    writer
        .write_message(&SampleStreamRequest {
            table: "t".to_string(),
            num_samples: 1,
            flexible_batch_size: 1,
            rate_limiter_timeout_ms: None,
        })
        .await
        .unwrap();
    writer.shutdown().await.unwrap();

    let (frames, status) = drain_rpc::<SampleStreamResponse>(&mut reader).await;
    assert_eq!(status.code, StatusCode::Ok.as_i32());
    let item = frames[0].entries[0]
        .info
        .as_ref()
        .unwrap()
        .item
        .as_ref()
        .unwrap();
    assert_eq!(item.key, 100);
    assert_eq!(item.times_sampled, 1);
}

#[tokio::test]
async fn test_unknown_method_rejected() {
    let addr = start_server().await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = stream.into_split();
    let mut writer = FrameWriter::new(write_half);
    writer
        .write_message(&RpcHeader { method: 0 })
        .await
        .unwrap();

    let mut reader = FrameReader::new(read_half);
    let (frames, status) = drain_rpc::<SampleStreamResponse>(&mut reader).await;
    assert!(frames.is_empty());
    assert_eq!(status.code, StatusCode::InvalidArgument.as_i32());
}
