//! Transport seams the stream handlers are written against.
//!
//! The real server speaks length-delimited prost frames over TCP; tests and
//! in-process clients use the channel-backed `local` transport. Handlers only
//! see these traits plus the per-stream `StreamContext`.

use async_trait::async_trait;
use replaybuf_core::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-message write options.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Skip transport compression; chunk payloads arrive pre-compressed.
    pub no_compression: bool,
}

impl WriteOptions {
    pub fn no_compression() -> Self {
        Self {
            no_compression: true,
        }
    }
}

/// Ordered inbound half of a stream.
#[async_trait]
pub trait StreamReader<T>: Send {
    /// Next message, or `None` once the peer half-closed the stream.
    async fn recv(&mut self) -> Result<Option<T>>;
}

/// Ordered outbound half of a stream.
#[async_trait]
pub trait StreamWriter<T>: Send {
    async fn send(&mut self, message: T, options: WriteOptions) -> Result<()>;
}

struct CancelState {
    flag: AtomicBool,
    notify: tokio::sync::Notify,
}

/// Connection-scoped state handlers may consult: the peer address and a
/// cancellation signal raised by the transport when the client goes away.
pub struct StreamContext {
    peer: String,
    cancel: Arc<CancelState>,
}

impl StreamContext {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            cancel: Arc::new(CancelState {
                flag: AtomicBool::new(false),
                notify: tokio::sync::Notify::new(),
            }),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.flag.load(Ordering::Acquire)
    }

    /// Resolves once the transport has reported the peer gone. Lets the
    /// connection driver race a handler that is parked in a long wait.
    pub async fn cancelled(&self) {
        let mut notified = std::pin::pin!(self.cancel.notify.notified());
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Handle the transport keeps to signal cancellation.
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle(Arc::clone(&self.cancel))
    }
}

#[derive(Clone)]
pub struct CancellationHandle(Arc<CancelState>);

impl CancellationHandle {
    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }
}

/// Channel-backed streams for tests and in-process clients.
///
/// Dropping the writer is observed as end-of-stream by the reader; dropping
/// the reader makes subsequent writes fail, which is how tests exercise the
/// handlers' write-failure paths.
pub mod local {
    use super::{StreamReader, StreamWriter, WriteOptions};
    use async_trait::async_trait;
    use replaybuf_core::{Result, Status};
    use tokio::sync::mpsc;

    pub struct LocalWriter<T> {
        tx: mpsc::Sender<T>,
    }

    pub struct LocalReader<T> {
        rx: mpsc::Receiver<T>,
    }

    /// A connected (writer, reader) pair carrying messages of one type.
    pub fn stream_pair<T: Send>(capacity: usize) -> (LocalWriter<T>, LocalReader<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (LocalWriter { tx }, LocalReader { rx })
    }

    #[async_trait]
    impl<T: Send> StreamReader<T> for LocalReader<T> {
        async fn recv(&mut self) -> Result<Option<T>> {
            Ok(self.rx.recv().await)
        }
    }

    #[async_trait]
    impl<T: Send> StreamWriter<T> for LocalWriter<T> {
        async fn send(&mut self, message: T, _options: WriteOptions) -> Result<()> {
            self.tx
                .send(message)
                .await
                .map_err(|_| Status::unavailable("stream closed by peer"))
        }
    }
}
