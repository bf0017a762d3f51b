// TCP transport speaking length-delimited prost frames
//
// One connection carries one RPC. The client opens with an RpcHeader frame,
// then streams request messages; the server streams response messages and
// finishes with a trailer frame carrying the terminal RpcStatus. A frame is
// a 1-byte kind, a u32 big-endian length, and a prost body. End-of-stream
// from the client is a TCP half-close; a read error (reset) cancels the
// stream context and abandons the RPC.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use replaybuf_core::{Status, StatusCode};
use replaybuf_proto::{
    CheckpointRequest, MutatePrioritiesRequest, ResetRequest, RpcHeader, RpcMethod, RpcStatus,
    ServerInfoRequest,
};
use replaybuf_service::transport::{StreamContext, StreamReader, StreamWriter, WriteOptions};
use replaybuf_service::ReplayService;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const FRAME_MESSAGE: u8 = 0;
pub const FRAME_TRAILER: u8 = 1;

/// Inbound frames are capped comfortably above the 40 MiB sample frame bound.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Reads frames off the wire.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin + Send> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next frame as (kind, body), or `None` on a clean end of stream.
    pub async fn read_frame(&mut self) -> replaybuf_core::Result<Option<(u8, Bytes)>> {
        let kind = match self.inner.read_u8().await {
            Ok(kind) => kind,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Status::unavailable(format!("connection error: {}", e))),
        };
        let len = self
            .inner
            .read_u32()
            .await
            .map_err(|e| Status::unavailable(format!("connection error: {}", e)))?
            as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Status::invalid_argument(format!(
                "frame of {} bytes exceeds the maximum of {} bytes",
                len, MAX_FRAME_SIZE
            )));
        }
        let mut body = vec![0u8; len];
        self.inner
            .read_exact(&mut body)
            .await
            .map_err(|e| Status::unavailable(format!("connection error: {}", e)))?;
        Ok(Some((kind, Bytes::from(body))))
    }

    /// Next message frame, or `None` on a clean end of stream.
    pub async fn read_message<T: Message + Default>(
        &mut self,
    ) -> replaybuf_core::Result<Option<T>> {
        let Some((kind, body)) = self.read_frame().await? else {
            return Ok(None);
        };
        if kind != FRAME_MESSAGE {
            return Err(Status::internal(format!(
                "expected a message frame, got kind {}",
                kind
            )));
        }
        T::decode(body).map(Some).map_err(|e| {
            Status::internal(format!("failed to decode message: {}", e))
        })
    }
}

/// Writes frames to the wire.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin + Send> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, kind: u8, body: &[u8]) -> replaybuf_core::Result<()> {
        let write = async {
            self.inner.write_u8(kind).await?;
            self.inner.write_u32(body.len() as u32).await?;
            self.inner.write_all(body).await?;
            self.inner.flush().await
        };
        write
            .await
            .map_err(|e| Status::unavailable(format!("connection error: {}", e)))
    }

    pub async fn write_message<T: Message>(&mut self, message: &T) -> replaybuf_core::Result<()> {
        self.write_frame(FRAME_MESSAGE, &message.encode_to_vec()).await
    }

    pub async fn write_trailer(&mut self, status: &RpcStatus) -> replaybuf_core::Result<()> {
        self.write_frame(FRAME_TRAILER, &status.encode_to_vec()).await
    }

    /// Half-close the stream, signalling end of requests to the peer.
    pub async fn shutdown(&mut self) -> replaybuf_core::Result<()> {
        self.inner
            .shutdown()
            .await
            .map_err(|e| Status::unavailable(format!("connection error: {}", e)))
    }
}

type SharedFrameWriter = Arc<Mutex<FrameWriter<OwnedWriteHalf>>>;

/// Aborts the read pump when the connection handler is done with it.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Inbound frames funnelled through the read pump's channel.
struct FrameRx {
    rx: mpsc::Receiver<(u8, Bytes)>,
}

impl FrameRx {
    /// Next message frame, or `None` once the peer stopped sending requests.
    async fn read_message<T: Message + Default>(&mut self) -> replaybuf_core::Result<Option<T>> {
        let Some((kind, body)) = self.rx.recv().await else {
            return Ok(None);
        };
        if kind != FRAME_MESSAGE {
            return Err(Status::internal(format!(
                "expected a message frame, got kind {}",
                kind
            )));
        }
        T::decode(body).map(Some).map_err(|e| {
            Status::internal(format!("failed to decode message: {}", e))
        })
    }
}

/// Adapts the inbound frame stream to the handlers' `StreamReader` seam.
struct RpcStreamReader<T> {
    frames: FrameRx,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RpcStreamReader<T> {
    fn new(frames: FrameRx) -> Self {
        Self {
            frames,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Message + Default> StreamReader<T> for RpcStreamReader<T> {
    async fn recv(&mut self) -> replaybuf_core::Result<Option<T>> {
        self.frames.read_message().await
    }
}

/// Adapts the shared outbound frame sink to the handlers' `StreamWriter`
/// seam. Shared so the connection driver can append the trailer afterwards.
struct RpcStreamWriter<T> {
    frames: SharedFrameWriter,
    _marker: PhantomData<fn(T)>,
}

impl<T> RpcStreamWriter<T> {
    fn new(frames: SharedFrameWriter) -> Self {
        Self {
            frames,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Message + Send> StreamWriter<T> for RpcStreamWriter<T> {
    async fn send(&mut self, message: T, _options: WriteOptions) -> replaybuf_core::Result<()> {
        // This transport never compresses, so no_compression is a no-op.
        self.frames.lock().await.write_message(&message).await
    }
}

/// Accept connections until `shutdown` resolves, then close the service.
pub async fn serve(
    service: ReplayService,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, closing tables and chunk store");
                service.close();
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("Failed to accept connection")?;
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(status) = handle_connection(service, stream, peer).await {
                        warn!(%peer, "connection failed: {}", status);
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    service: ReplayService,
    stream: TcpStream,
    peer: SocketAddr,
) -> replaybuf_core::Result<()> {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let frames_out: SharedFrameWriter = Arc::new(Mutex::new(FrameWriter::new(write_half)));
    let context = StreamContext::new(peer.to_string());

    // The pump owns the read half. A half-close is the normal end of the
    // request stream; a read error means the peer is gone and raises the
    // context's cancellation signal even while a handler is parked.
    let cancel = context.cancellation_handle();
    let (frame_tx, frame_rx) = mpsc::channel(1);
    let pump = tokio::spawn(async move {
        let mut frames_in = FrameReader::new(read_half);
        loop {
            match frames_in.read_frame().await {
                Ok(Some(frame)) => {
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    cancel.cancel();
                    break;
                }
            }
        }
    });
    let _pump_guard = AbortOnDrop(pump);

    let mut frames = FrameRx { rx: frame_rx };
    // Connection closed before any RPC was named.
    let Some(header) = frames.read_message::<RpcHeader>().await? else {
        return Ok(());
    };
    let method = RpcMethod::try_from(header.method).unwrap_or(RpcMethod::Unknown);
    debug!(%peer, ?method, "rpc started");

    let outcome = tokio::select! {
        outcome = dispatch(&service, &context, method, frames, &frames_out) => outcome,
        _ = context.cancelled() => {
            debug!(%peer, ?method, "peer disconnected, abandoning rpc");
            return Ok(());
        }
    };
    let trailer = match &outcome {
        Ok(()) => RpcStatus {
            code: StatusCode::Ok.as_i32(),
            message: String::new(),
        },
        Err(status) => {
            debug!(%peer, ?method, "rpc failed: {}", status);
            RpcStatus {
                code: status.code().as_i32(),
                message: status.message().to_string(),
            }
        }
    };
    let result = frames_out.lock().await.write_trailer(&trailer).await;
    result
}

async fn dispatch(
    service: &ReplayService,
    context: &StreamContext,
    method: RpcMethod,
    mut frames: FrameRx,
    frames_out: &SharedFrameWriter,
) -> replaybuf_core::Result<()> {
    match method {
        RpcMethod::Checkpoint => {
            let request = require_message::<CheckpointRequest>(&mut frames).await?;
            let response = service.checkpoint(request).await?;
            frames_out.lock().await.write_message(&response).await
        }
        RpcMethod::MutatePriorities => {
            let request = require_message::<MutatePrioritiesRequest>(&mut frames).await?;
            let response = service.mutate_priorities(request).await?;
            frames_out.lock().await.write_message(&response).await
        }
        RpcMethod::Reset => {
            let request = require_message::<ResetRequest>(&mut frames).await?;
            let response = service.reset(request).await?;
            frames_out.lock().await.write_message(&response).await
        }
        RpcMethod::ServerInfo => {
            let request = require_message::<ServerInfoRequest>(&mut frames).await?;
            let response = service.server_info(request);
            frames_out.lock().await.write_message(&response).await
        }
        RpcMethod::InsertStream => {
            service
                .insert_stream(
                    RpcStreamReader::new(frames),
                    RpcStreamWriter::new(Arc::clone(frames_out)),
                )
                .await
        }
        RpcMethod::SampleStream => {
            service
                .sample_stream(
                    context,
                    RpcStreamReader::new(frames),
                    RpcStreamWriter::new(Arc::clone(frames_out)),
                )
                .await
        }
        RpcMethod::InitializeConnection => {
            service
                .initialize_connection(
                    context,
                    RpcStreamReader::new(frames),
                    RpcStreamWriter::new(Arc::clone(frames_out)),
                )
                .await
        }
        RpcMethod::Unknown => Err(Status::invalid_argument("unknown rpc method")),
    }
}

async fn require_message<T: Message + Default>(
    frames: &mut FrameRx,
) -> replaybuf_core::Result<T> {
    frames
        .read_message()
        .await?
        .ok_or_else(|| Status::invalid_argument("request message missing"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use replaybuf_proto::ResetRequest;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let request = ResetRequest {
            table: "t".to_string(),
        };
        writer.write_message(&request).await.unwrap();
        writer
            .write_trailer(&RpcStatus {
                code: 0,
                message: String::new(),
            })
            .await
            .unwrap();
        drop(writer);

        let decoded: ResetRequest = reader.read_message().await.unwrap().unwrap();
        assert_eq!(decoded, request);

        let (kind, body) = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(kind, FRAME_TRAILER);
        let status = RpcStatus::decode(body).unwrap();
        assert_eq!(status.code, 0);

        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::<_>::new(server);

        let writer_task = tokio::spawn(async move {
            let mut client = client;
            client.write_u8(FRAME_MESSAGE).await.unwrap();
            client.write_u32(u32::MAX).await.unwrap();
        });

        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.code(), StatusCode::InvalidArgument);
        writer_task.await.unwrap();
    }
}
