use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::error::{MeshError, Result};
use crate::protocol::ServiceMessage;
use crate::transport::frame::{read_frame, write_encoded, Frame, FrameKind, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::{ClientChannel, ClientTransport, MessageStream};

/// Default timeout for establishing a connection (5 seconds)
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// TCP transport settings shared by client and server.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Largest frame sent or accepted (default: 16 MB)
    pub max_frame_size: usize,
    /// Connect deadline (default: 5s)
    pub connect_timeout: Duration,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Opens multiplexed TCP channels.
///
/// # Example
///
/// ```no_run
/// use meshrpc_common::transport::{ClientTransport, TcpClientTransport};
///
/// # async fn example() -> meshrpc_common::Result<()> {
/// let transport = TcpClientTransport::default();
/// let channel = transport.create("127.0.0.1:7070").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TcpClientTransport {
    config: TcpConfig,
}

impl TcpClientTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientTransport for TcpClientTransport {
    async fn create(&self, address: &str) -> Result<Arc<dyn ClientChannel>> {
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                MeshError::Connection(format!(
                    "Timed out connecting to {} after {}ms",
                    address,
                    self.config.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| MeshError::Connection(format!("Failed to connect to {}: {}", address, e)))?;

        stream
            .set_nodelay(true)
            .map_err(|e| MeshError::Connection(format!("Failed to configure socket: {}", e)))?;

        debug!("Connected to {}", address);
        Ok(Arc::new(TcpClientChannel::start(address, stream, &self.config)))
    }
}

enum Pending {
    Single(oneshot::Sender<Result<ServiceMessage>>),
    Stream(mpsc::UnboundedSender<Result<ServiceMessage>>),
}

type PendingMap = Arc<DashMap<u64, Pending>>;

/// One TCP connection shared by all calls to an address.
///
/// Every exchange gets its own stream id; a reader task routes `Next` and
/// `Complete` frames back to the waiting call. A request larger than
/// `max_frame_size` fails on its own and never reaches the connection.
pub struct TcpClientChannel {
    address: String,
    max_frame_size: usize,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pending: PendingMap,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
}

impl TcpClientChannel {
    fn start(address: &str, stream: TcpStream, config: &TcpConfig) -> Self {
        let (reader, writer) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(writer, rx, closed.clone()));
        tokio::spawn(read_loop(
            address.to_string(),
            reader,
            config.max_frame_size,
            pending.clone(),
            closed.clone(),
        ));

        Self {
            address: address.to_string(),
            max_frame_size: config.max_frame_size,
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            closed,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let bytes = frame
            .encode_within(self.max_frame_size)
            .map_err(|e| match e {
                MeshError::Codec(reason) => {
                    MeshError::Codec(format!("Request to {} rejected: {}", self.address, reason))
                }
                other => other,
            })?;
        self.outbound
            .send(bytes)
            .map_err(|_| MeshError::Connection(format!("Connection to {} is closed", self.address)))
    }

    /// Registers a pending exchange and sends its opening frame.
    fn open(&self, kind: FrameKind, message: ServiceMessage, pending: Pending) -> Result<PendingGuard> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(id, pending);
        let guard = PendingGuard {
            id,
            pending: self.pending.clone(),
        };

        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Connection(format!(
                "Connection to {} is closed",
                self.address
            )));
        }
        self.send_frame(Frame::with_message(kind, id, message))?;
        Ok(guard)
    }
}

#[async_trait]
impl ClientChannel for TcpClientChannel {
    async fn fire_and_forget(&self, message: ServiceMessage) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send_frame(Frame::with_message(FrameKind::Fire, id, message))
    }

    async fn request_response(&self, message: ServiceMessage) -> Result<ServiceMessage> {
        let (tx, rx) = oneshot::channel();
        let _guard = self.open(FrameKind::Request, message, Pending::Single(tx))?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(MeshError::Connection(format!(
                "Connection to {} closed before a response arrived",
                self.address
            ))),
        }
    }

    async fn request_stream(&self, message: ServiceMessage) -> Result<MessageStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let guard = self.open(FrameKind::Subscribe, message, Pending::Stream(tx))?;
        Ok(Box::pin(ResponseFrames {
            rx,
            cancel: CancelOnDrop {
                guard,
                outbound: self.outbound.clone(),
            },
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Removes the pending entry when the waiting call goes away, e.g. on timeout.
struct PendingGuard {
    id: u64,
    pending: PendingMap,
}

impl PendingGuard {
    fn release(&self) -> bool {
        self.pending.remove(&self.id).is_some()
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Sends `Cancel` if the subscription is dropped before it completed.
struct CancelOnDrop {
    guard: PendingGuard,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.guard.release() {
            debug!("Cancelling subscription {}", self.guard.id);
            if let Ok(bytes) = Frame::signal(FrameKind::Cancel, self.guard.id).encode() {
                let _ = self.outbound.send(bytes);
            }
        }
    }
}

struct ResponseFrames {
    rx: mpsc::UnboundedReceiver<Result<ServiceMessage>>,
    cancel: CancelOnDrop,
}

impl Stream for ResponseFrames {
    type Item = Result<ServiceMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for ResponseFrames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFrames")
            .field("stream_id", &self.cancel.guard.id)
            .finish()
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_encoded(&mut writer, &bytes).await {
            warn!("Dropping connection after write failure: {}", e);
            closed.store(true, Ordering::SeqCst);
            break;
        }
    }
    // Last sender gone: half-close so the server ends the connection.
    let _ = writer.shutdown().await;
}

async fn read_loop(
    address: String,
    mut reader: OwnedReadHalf,
    max_frame_size: usize,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) {
    let reason = loop {
        let frame = match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break format!("Connection to {} closed by peer", address),
            Err(e) => break format!("Connection to {} failed: {}", address, e),
        };
        route_frame(&pending, frame);
    };

    debug!("{}", reason);
    closed.store(true, Ordering::SeqCst);

    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, waiting)) = pending.remove(&id) {
            let err = MeshError::Connection(reason.clone());
            match waiting {
                Pending::Single(tx) => {
                    let _ = tx.send(Err(err));
                }
                Pending::Stream(tx) => {
                    let _ = tx.send(Err(err));
                }
            }
        }
    }
}

fn route_frame(pending: &PendingMap, frame: Frame) {
    match (frame.kind, frame.message) {
        (FrameKind::Next, Some(message)) => {
            let single = match pending.get(&frame.stream_id) {
                Some(entry) => match entry.value() {
                    Pending::Stream(tx) => {
                        let _ = tx.send(Ok(message));
                        return;
                    }
                    Pending::Single(_) => true,
                },
                None => {
                    debug!("Discarding response for released exchange {}", frame.stream_id);
                    return;
                }
            };
            if single {
                if let Some((_, Pending::Single(tx))) = pending.remove(&frame.stream_id) {
                    let _ = tx.send(Ok(message));
                }
            }
        }
        (FrameKind::Complete, _) => {
            pending.remove(&frame.stream_id);
        }
        (kind, _) => {
            warn!("Unexpected {:?} frame from server for {}", kind, frame.stream_id);
        }
    }
}
