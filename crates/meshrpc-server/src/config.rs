//! Hosting node configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use meshrpc_common::DEFAULT_CONTENT_TYPE;

/// Configuration of a [`ServiceNode`](crate::ServiceNode).
///
/// # Default Configuration
///
/// - `host`: `127.0.0.1`
/// - `port`: 0 (pick a free port)
/// - `tags`: none
/// - `content_types`: `["application/json"]`
/// - `default_timeout`: 30 seconds
///
/// # Example
///
/// ```
/// use meshrpc_server::NodeConfig;
/// use std::time::Duration;
///
/// let config = NodeConfig::default()
///     .with_port(4801)
///     .with_tag("zone", "eu-west")
///     .with_default_timeout(Duration::from_secs(5));
/// assert_eq!(config.bind_address(), "127.0.0.1:4801");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    /// Host to listen on and to announce
    pub host: String,
    /// Port to listen on, 0 for any free port
    pub port: u16,
    /// Endpoint tags announced with every local service
    pub tags: BTreeMap<String, String>,
    /// Content types the node accepts, preferred first
    pub content_types: Vec<String>,
    /// Timeout of calls made through the node's client side
    pub default_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            tags: BTreeMap::new(),
            content_types: vec![DEFAULT_CONTENT_TYPE.to_string()],
            default_timeout: Duration::from_secs(30),
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_content_types<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = content_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// `host:port` handed to the server transport.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checks the configuration before a node starts.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The host is empty
    /// - No content type is configured
    /// - The default timeout is zero
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        if self.content_types.is_empty() {
            return Err("at least one content type is required".to_string());
        }
        if self.default_timeout.is_zero() {
            return Err("default timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}
