use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::protocol::error::{codes, ErrorData, MeshError, Result};
use crate::protocol::ServiceMessage;
use crate::transport::frame::{read_frame, write_encoded, Frame, FrameKind};
use crate::transport::tcp::TcpConfig;
use crate::transport::{MessageHandler, ServerHandle, ServerTransport};

/// Async TCP server transport.
///
/// Accepts connections in a loop and serves each one on its own task. Every
/// connection multiplexes any number of concurrent exchanges.
#[derive(Debug, Clone, Default)]
pub struct TcpServerTransport {
    config: TcpConfig,
}

impl TcpServerTransport {
    pub fn new(config: TcpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    async fn bind(&self, address: &str, handler: Arc<dyn MessageHandler>) -> Result<ServerHandle> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| MeshError::Connection(format!("Failed to bind to {}: {}", address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MeshError::Connection(format!("Failed to get local addr: {}", e)))?;

        info!("Listening on {}", local_addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, handler, self.config.clone(), stop_rx));

        Ok(ServerHandle::new(local_addr.to_string(), move || {
            let _ = stop_tx.send(true);
        }))
    }
}

/// Resolves once shutdown was requested. A dropped sender never resolves.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    config: TcpConfig,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Connection established from {}", peer_addr);
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set nodelay for {}: {}", peer_addr, e);
                    }
                    tokio::spawn(serve_connection(
                        stream,
                        handler.clone(),
                        config.max_frame_size,
                        stop.clone(),
                    ));
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
        }
    }
    info!("Server stopped accepting connections");
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn MessageHandler>,
    max_frame_size: usize,
    mut stop: watch::Receiver<bool>,
) {
    let (mut reader, writer) = stream.into_split();
    let (outbound, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, rx));
    let producers: Producers = Arc::new(DashMap::new());

    loop {
        let frame = tokio::select! {
            _ = stopped(&mut stop) => break,
            frame = read_frame(&mut reader, max_frame_size) => frame,
        };
        match frame {
            Ok(Some(frame)) => dispatch(frame, &handler, &outbound, &producers, max_frame_size),
            Ok(None) => {
                debug!("Connection closed by peer");
                break;
            }
            Err(e) => {
                warn!("Connection error: {}", e);
                break;
            }
        }
    }

    let ids: Vec<u64> = producers.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, producer)) = producers.remove(&id) {
            producer.abort();
        }
    }
    writer_task.abort();
}

type Producers = Arc<DashMap<u64, AbortHandle>>;

fn dispatch(
    frame: Frame,
    handler: &Arc<dyn MessageHandler>,
    outbound: &mpsc::UnboundedSender<Vec<u8>>,
    producers: &Producers,
    max_frame_size: usize,
) {
    let stream_id = frame.stream_id;
    match (frame.kind, frame.message) {
        (FrameKind::Fire, Some(message)) => {
            let handler = handler.clone();
            tokio::spawn(async move { handler.fire_and_forget(message).await });
        }
        (FrameKind::Request, Some(message)) => {
            let handler = handler.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let reply = handler.request_response(message).await;
                if let Some((bytes, _)) = reply_frame(stream_id, reply, max_frame_size) {
                    let _ = outbound.send(bytes);
                }
            });
        }
        (FrameKind::Subscribe, Some(message)) => {
            let qualifier = message.qualifier().clone();
            let mut responses = handler.request_stream(message);
            let outbound = outbound.clone();
            let registry = producers.clone();
            let (registered_tx, registered_rx) = oneshot::channel::<()>();
            let task = tokio::spawn(async move {
                // The abort handle is in the registry before anything is produced.
                let _ = registered_rx.await;
                while let Some(item) = responses.next().await {
                    let reply = match item {
                        Ok(reply) => reply,
                        Err(e) => ServiceMessage::error(qualifier.clone(), e.error_data()),
                    };
                    let Some((bytes, replaced)) = reply_frame(stream_id, reply, max_frame_size) else {
                        break;
                    };
                    if outbound.send(bytes).is_err() {
                        registry.remove(&stream_id);
                        return;
                    }
                    if replaced {
                        break;
                    }
                }
                registry.remove(&stream_id);
                if let Ok(bytes) = Frame::signal(FrameKind::Complete, stream_id).encode() {
                    let _ = outbound.send(bytes);
                }
            });
            producers.insert(stream_id, task.abort_handle());
            let _ = registered_tx.send(());
        }
        (FrameKind::Cancel, _) => {
            if let Some((_, producer)) = producers.remove(&stream_id) {
                debug!("Subscription {} cancelled by client", stream_id);
                producer.abort();
            }
        }
        (kind, _) => warn!("Ignoring unexpected {:?} frame {}", kind, stream_id),
    }
}

/// Encodes one `Next` frame. A reply over `max_frame_size` is replaced by an
/// error reply for the same exchange; the flag reports that replacement.
fn reply_frame(stream_id: u64, reply: ServiceMessage, max_frame_size: usize) -> Option<(Vec<u8>, bool)> {
    let qualifier = reply.qualifier().clone();
    let err = match Frame::with_message(FrameKind::Next, stream_id, reply).encode_within(max_frame_size) {
        Ok(bytes) => return Some((bytes, false)),
        Err(err) => err,
    };

    warn!("Reply for {} on exchange {} not sent: {}", qualifier, stream_id, err);
    let data = ErrorData::new(codes::APPLICATION, format!("Reply for {} not sent: {}", qualifier, err));
    match Frame::with_message(FrameKind::Next, stream_id, ServiceMessage::error(qualifier, data))
        .encode_within(max_frame_size)
    {
        Ok(bytes) => Some((bytes, true)),
        Err(err) => {
            warn!("Dropping exchange {}: {}", stream_id, err);
            None
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_encoded(&mut writer, &bytes).await {
            warn!("Failed to send frame: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}
