use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::protocol::error::{MeshError, Result};
use crate::protocol::ServiceMessage;
use crate::transport::{
    ClientChannel, ClientTransport, MessageHandler, MessageStream, ServerHandle, ServerTransport,
};

/// First port handed out for `host:0` binds.
const FIRST_EPHEMERAL_PORT: u16 = 20000;

/// In-process transport.
///
/// Servers bound through it are reachable by channels created through any
/// clone of the same transport. Messages are handed over without encoding.
/// Useful for tests that need several nodes without sockets.
#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<LocalInner>,
}

struct LocalInner {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
    next_port: AtomicU16,
    connect_attempts: AtomicUsize,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LocalInner {
                handlers: DashMap::new(),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
                connect_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of [`ClientTransport::create`] calls so far, failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Currently bound addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .inner
            .handlers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        addresses.sort();
        addresses
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("addresses", &self.addresses())
            .field("connect_attempts", &self.connect_attempts())
            .finish()
    }
}

#[async_trait]
impl ServerTransport for LocalTransport {
    async fn bind(&self, address: &str, handler: Arc<dyn MessageHandler>) -> Result<ServerHandle> {
        let address = match address.strip_suffix(":0") {
            Some(host) => {
                let port = self.inner.next_port.fetch_add(1, Ordering::SeqCst);
                format!("{}:{}", host, port)
            }
            None => address.to_string(),
        };

        match self.inner.handlers.entry(address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MeshError::Transport(format!("Address {} already in use", address)));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handler);
            }
        }
        debug!("Local server bound at {}", address);

        let inner = self.inner.clone();
        let bound = address.clone();
        Ok(ServerHandle::new(address, move || {
            inner.handlers.remove(&bound);
        }))
    }
}

#[async_trait]
impl ClientTransport for LocalTransport {
    async fn create(&self, address: &str) -> Result<Arc<dyn ClientChannel>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.inner.handlers.contains_key(address) {
            return Err(MeshError::Connection(format!("No local server at {}", address)));
        }
        Ok(Arc::new(LocalChannel {
            address: address.to_string(),
            inner: self.inner.clone(),
        }))
    }
}

/// Channel to a handler bound on a [`LocalTransport`].
///
/// The handler is looked up per exchange, so a shut down server makes the
/// channel fail instead of reaching a stale handler.
struct LocalChannel {
    address: String,
    inner: Arc<LocalInner>,
}

impl LocalChannel {
    fn handler(&self) -> Result<Arc<dyn MessageHandler>> {
        self.inner
            .handlers
            .get(&self.address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeshError::Connection(format!("Local server at {} is gone", self.address)))
    }
}

#[async_trait]
impl ClientChannel for LocalChannel {
    async fn fire_and_forget(&self, message: ServiceMessage) -> Result<()> {
        let handler = self.handler()?;
        tokio::spawn(async move { handler.fire_and_forget(message).await });
        Ok(())
    }

    async fn request_response(&self, message: ServiceMessage) -> Result<ServiceMessage> {
        let handler = self.handler()?;
        // Detached: the server side completes even if the caller gives up.
        tokio::spawn(async move { handler.request_response(message).await })
            .await
            .map_err(|e| MeshError::Transport(format!("Local exchange with {} failed: {}", self.address, e)))
    }

    async fn request_stream(&self, message: ServiceMessage) -> Result<MessageStream> {
        Ok(self.handler()?.request_stream(message))
    }

    fn is_closed(&self) -> bool {
        !self.inner.handlers.contains_key(&self.address)
    }
}
