//! MeshRPC Transport Boundary
//!
//! The core never touches sockets. It talks to a [`ClientTransport`] that
//! opens [`ClientChannel`]s to addresses, and hands inbound messages to a
//! [`MessageHandler`] bound through a [`ServerTransport`].
//!
//! # Components
//!
//! - **[`MessageCodec`]** / **[`CodecRegistry`]**: payload codecs keyed by content type
//! - **[`TcpClientTransport`]** / **[`TcpServerTransport`]**: multiplexed TCP, see [`frame`]
//! - **[`LocalTransport`]**: in-process transport for tests and embedded nodes
//!
//! A channel must accept concurrent sends from many in-flight calls; one
//! channel per remote address is enough.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::protocol::error::Result;
use crate::protocol::{CommunicationMode, ServiceMessage};

pub mod codec;
pub mod frame;
pub mod local;
pub mod tcp;
pub mod tcp_server;

pub use codec::{CodecRegistry, JsonCodec, MessageCodec};
pub use local::LocalTransport;
pub use tcp::{TcpClientChannel, TcpClientTransport, TcpConfig};
pub use tcp_server::TcpServerTransport;


/// A lazy, finite sequence of response messages.
///
/// Dropping the stream cancels the exchange.
pub type MessageStream = BoxStream<'static, Result<ServiceMessage>>;

/// What came back from [`ClientChannel::send`].
pub enum Exchange {
    /// Fire-and-forget and one-way calls.
    None,
    Single(ServiceMessage),
    Stream(MessageStream),
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exchange::None => f.write_str("Exchange::None"),
            Exchange::Single(message) => f.debug_tuple("Exchange::Single").field(message).finish(),
            Exchange::Stream(_) => f.write_str("Exchange::Stream(..)"),
        }
    }
}

/// Opens channels to remote addresses.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Opens a channel to `address` (`host:port`).
    async fn create(&self, address: &str) -> Result<Arc<dyn ClientChannel>>;
}

/// A bidirectional, multiplexed channel to one remote address.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    /// Sends without waiting for anything back.
    async fn fire_and_forget(&self, message: ServiceMessage) -> Result<()>;

    /// Sends and waits for exactly one response message.
    async fn request_response(&self, message: ServiceMessage) -> Result<ServiceMessage>;

    /// Sends and returns the response stream.
    async fn request_stream(&self, message: ServiceMessage) -> Result<MessageStream>;

    /// Whether the channel can no longer be used.
    fn is_closed(&self) -> bool {
        false
    }

    /// Sends `message` with the exchange shape of `mode`.
    async fn send(&self, message: ServiceMessage, mode: CommunicationMode) -> Result<Exchange> {
        match mode {
            CommunicationMode::FireAndForget | CommunicationMode::OneWay => {
                self.fire_and_forget(message).await?;
                Ok(Exchange::None)
            }
            CommunicationMode::RequestResponse => {
                Ok(Exchange::Single(self.request_response(message).await?))
            }
            CommunicationMode::RequestStream => {
                Ok(Exchange::Stream(self.request_stream(message).await?))
            }
        }
    }
}

/// Server side of an exchange.
///
/// Failures are reported as error messages, never as transport errors, so
/// the transport only has to deliver what the handler returns.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn fire_and_forget(&self, message: ServiceMessage);

    async fn request_response(&self, message: ServiceMessage) -> ServiceMessage;

    fn request_stream(&self, message: ServiceMessage) -> MessageStream;
}

/// Binds a [`MessageHandler`] to a listening address.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Starts serving on `address`. Port `0` picks a free port; the actual
    /// address is reported by the returned handle.
    async fn bind(&self, address: &str, handler: Arc<dyn MessageHandler>) -> Result<ServerHandle>;
}

type ShutdownFn = Box<dyn FnOnce() + Send>;

/// A running server.
pub struct ServerHandle {
    address: String,
    shutdown: Mutex<Option<ShutdownFn>>,
}

impl ServerHandle {
    pub fn new(address: impl Into<String>, shutdown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            address: address.into(),
            shutdown: Mutex::new(Some(Box::new(shutdown))),
        }
    }

    /// The address the server actually listens on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stops accepting and serving. Calling it again does nothing.
    pub fn shutdown(&self) {
        let shutdown = self.shutdown.lock().ok().and_then(|mut guard| guard.take());
        if let Some(shutdown) = shutdown {
            shutdown();
        }
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("address", &self.address)
            .finish()
    }
}
