use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use meshrpc_common::protocol::error::{MeshError, Result};
use meshrpc_common::transport::{ClientChannel, ClientTransport};
use tokio::sync::Mutex;
use tracing::debug;

/// Channel pool configuration.
///
/// # Default Configuration
///
/// - `connect_timeout_ms`: 5000 (5 seconds)
///
/// # Example
///
/// ```rust
/// use meshrpc_client::PoolConfig;
///
/// let config = PoolConfig { connect_timeout_ms: 1000 };
/// assert_eq!(config.connect_timeout_ms, 1000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum time to wait for a new channel in milliseconds
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
        }
    }
}

/// Client channels keyed by endpoint address.
///
/// Channels are multiplexed, so one channel per address is shared by every
/// call to that address. A channel that reports itself closed, or that was
/// [`invalidate`](Self::invalidate)d after a transport failure, is replaced
/// on the next [`acquire`](Self::acquire).
///
/// # Example
///
/// ```rust,no_run
/// use meshrpc_client::ChannelPool;
/// use meshrpc_common::transport::TcpClientTransport;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = ChannelPool::new(Arc::new(TcpClientTransport::default()));
/// let channel = pool.acquire("127.0.0.1:4801").await?;
/// # Ok(())
/// # }
/// ```
pub struct ChannelPool {
    transport: Arc<dyn ClientTransport>,
    channels: Mutex<HashMap<String, Arc<dyn ClientChannel>>>,
    config: PoolConfig,
}

impl ChannelPool {
    pub fn new(transport: Arc<dyn ClientTransport>) -> Self {
        Self::with_config(transport, PoolConfig::default())
    }

    pub fn with_config(transport: Arc<dyn ClientTransport>, config: PoolConfig) -> Self {
        Self {
            transport,
            channels: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the open channel to `address`, creating one if needed.
    ///
    /// # Errors
    ///
    /// - [`MeshError::Connection`] if the transport cannot reach `address`
    ///   or does not answer within `connect_timeout_ms`
    pub async fn acquire(&self, address: &str) -> Result<Arc<dyn ClientChannel>> {
        {
            let mut channels = self.channels.lock().await;
            match channels.get(address) {
                Some(channel) if !channel.is_closed() => return Ok(channel.clone()),
                Some(_) => {
                    debug!("Dropping closed channel to {}", address);
                    channels.remove(address);
                }
                None => {}
            }
        }

        // Connect without holding the lock so other addresses are not blocked.
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let created = tokio::time::timeout(timeout, self.transport.create(address))
            .await
            .map_err(|_| {
                MeshError::Connection(format!(
                    "connect to {} timed out after {}ms",
                    address, self.config.connect_timeout_ms
                ))
            })??;

        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get(address) {
            if !existing.is_closed() {
                // Lost a race with a concurrent acquire; keep the first channel.
                return Ok(existing.clone());
            }
        }
        debug!("Opened channel to {}", address);
        channels.insert(address.to_string(), created.clone());
        Ok(created)
    }

    /// Forgets `failed` so the next call to `address` reconnects.
    ///
    /// A channel that already replaced `failed` stays pooled.
    pub async fn invalidate(&self, address: &str, failed: &Arc<dyn ClientChannel>) {
        let mut channels = self.channels.lock().await;
        if channels.get(address).is_some_and(|pooled| Arc::ptr_eq(pooled, failed)) {
            channels.remove(address);
            debug!("Invalidated channel to {}", address);
        }
    }

    /// Number of pooled channels.
    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
