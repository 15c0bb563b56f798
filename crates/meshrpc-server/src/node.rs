use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use meshrpc_client::{ChannelPool, PoolConfig, ServiceCall, ServiceProxy};
use meshrpc_common::protocol::error::{MeshError, Result};
use meshrpc_common::transport::{
    ClientTransport, CodecRegistry, LocalTransport, ServerHandle, ServerTransport, TcpClientTransport,
    TcpServerTransport,
};
use meshrpc_common::{Qualifier, ServiceDescriptor};
use meshrpc_metrics::MetricsSink;
use meshrpc_registry::{Member, MembershipEvent, RoundRobinRouter, ServiceEndpoint, ServiceRegistry};
use tracing::info;

use crate::binding::{ServiceBinding, ServiceProvider};
use crate::config::NodeConfig;
use crate::dispatch::DispatchTable;

/// A cluster member hosting services.
///
/// A node owns the pieces a member needs: the dispatch table serving its
/// local services, the server transport they are reachable through, the
/// service registry with its view of the cluster, and a client side that
/// routes calls through that registry.
///
/// Membership is not discovered by the node itself. Whatever gossip layer
/// is in use publishes [`metadata`](Self::metadata) for this node and feeds
/// events about other members into
/// [`on_membership_event`](Self::on_membership_event).
///
/// # Example
///
/// ```rust,no_run
/// use meshrpc_server::{NodeConfig, ServiceBinding, ServiceNode};
///
/// # async fn example() -> meshrpc_common::Result<()> {
/// let greeting = ServiceBinding::builder("io.example.Greeting")
///     .request_response("greeting", |name: String| async move { Ok(format!("hello {}", name)) })
///     .build()?;
///
/// let node = ServiceNode::builder()
///     .config(NodeConfig::default().with_port(4801))
///     .binding(greeting)
///     .start()
///     .await?;
///
/// println!("Serving on {}", node.address());
/// # Ok(())
/// # }
/// ```
pub struct ServiceNode {
    config: NodeConfig,
    registry: Arc<ServiceRegistry>,
    dispatch: Arc<DispatchTable>,
    call: ServiceCall,
    handle: ServerHandle,
    services: Vec<ServiceDescriptor>,
}

impl ServiceNode {
    pub fn builder() -> ServiceNodeBuilder {
        ServiceNodeBuilder::new()
    }

    /// Endpoint id of this node, equal to its bound address.
    pub fn id(&self) -> &str {
        self.registry.local_id()
    }

    pub fn address(&self) -> &str {
        self.handle.address()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    /// Descriptors of the services hosted here.
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    /// Qualifiers served by this node, sorted.
    pub fn qualifiers(&self) -> Vec<Qualifier> {
        self.dispatch.qualifiers()
    }

    /// Invocation pipeline routing through this node's registry.
    ///
    /// Uses round-robin routing and the configured default timeout; both
    /// can be overridden on the returned value.
    pub fn call(&self) -> ServiceCall {
        self.call.clone()
    }

    /// Client stub for `descriptor`.
    pub fn api(&self, descriptor: &ServiceDescriptor) -> ServiceProxy {
        self.call.api(descriptor)
    }

    /// This node as a cluster member.
    pub fn member(&self) -> Result<Member> {
        let (host, port) = split_address(self.address())?;
        Ok(Member::new(self.id(), host, port))
    }

    /// Metadata announcing this node's services to other members.
    pub fn metadata(&self) -> HashMap<String, String> {
        self.registry.local_metadata()
    }

    /// The event other members should see for this node joining.
    pub fn announcement(&self) -> Result<MembershipEvent> {
        Ok(MembershipEvent::added(self.member()?, self.metadata()))
    }

    pub fn on_membership_event(&self, event: &MembershipEvent) {
        self.registry.on_membership_event(event);
    }

    /// Stops serving. Calls already in flight on other nodes fail with a
    /// connection error once they reach this one.
    pub fn shutdown(&self) {
        info!("Shutting down node {}", self.id());
        self.handle.shutdown();
    }
}

impl std::fmt::Debug for ServiceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceNode")
            .field("address", &self.address())
            .field("qualifiers", &self.qualifiers())
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServiceNode`].
///
/// Without explicit transports the node serves and calls over TCP.
pub struct ServiceNodeBuilder {
    config: NodeConfig,
    providers: Vec<Arc<dyn ServiceProvider>>,
    bindings: Vec<ServiceBinding>,
    client_transport: Option<Arc<dyn ClientTransport>>,
    server_transport: Option<Arc<dyn ServerTransport>>,
    pool_config: PoolConfig,
    metrics: Option<Arc<dyn MetricsSink>>,
    codecs: CodecRegistry,
}

impl ServiceNodeBuilder {
    fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            providers: Vec::new(),
            bindings: Vec::new(),
            client_transport: None,
            server_transport: None,
            pool_config: PoolConfig::default(),
            metrics: None,
            codecs: CodecRegistry::new(),
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Hosts every service `provider` exposes.
    pub fn service<P: ServiceProvider + 'static>(mut self, provider: Arc<P>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Hosts a single prebuilt service.
    pub fn binding(mut self, binding: ServiceBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Serves and calls through an in-process transport.
    pub fn transport(self, transport: LocalTransport) -> Self {
        self.client_transport(Arc::new(transport.clone()))
            .server_transport(Arc::new(transport))
    }

    pub fn client_transport(mut self, transport: Arc<dyn ClientTransport>) -> Self {
        self.client_transport = Some(transport);
        self
    }

    pub fn server_transport(mut self, transport: Arc<dyn ServerTransport>) -> Self {
        self.server_transport = Some(transport);
        self
    }

    pub fn pool_config(mut self, pool_config: PoolConfig) -> Self {
        self.pool_config = pool_config;
        self
    }

    /// Records served and outgoing calls into `metrics`.
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    /// Binds the server and registers the local services.
    ///
    /// # Errors
    ///
    /// - [`MeshError::Definition`] for an invalid configuration, a malformed
    ///   service or a qualifier bound twice. Nothing is bound in that case.
    /// - Transport errors if the address cannot be bound
    pub async fn start(self) -> Result<ServiceNode> {
        self.config.validate().map_err(MeshError::Definition)?;

        let mut bindings = self.bindings;
        for provider in self.providers {
            bindings.extend(provider.bindings()?);
        }

        let mut dispatch = DispatchTable::new().with_codecs(self.codecs.clone());
        if let Some(metrics) = &self.metrics {
            dispatch = dispatch.with_metrics(metrics.clone());
        }
        let mut services = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let mut tags = self.config.tags.clone();
            tags.extend(binding.tags().clone());
            services.push((binding.descriptor().clone(), tags));
            dispatch.add(binding)?;
        }
        let dispatch = Arc::new(dispatch);

        let server_transport = self
            .server_transport
            .unwrap_or_else(|| Arc::new(TcpServerTransport::default()));
        let client_transport = self
            .client_transport
            .unwrap_or_else(|| Arc::new(TcpClientTransport::default()));

        let handle = server_transport
            .bind(&self.config.bind_address(), dispatch.clone())
            .await?;

        let registry = match register(&handle, &self.config, &services) {
            Ok(registry) => Arc::new(registry),
            Err(e) => {
                handle.shutdown();
                return Err(e);
            }
        };

        let router = Arc::new(RoundRobinRouter::new(registry.clone()));
        let pool = Arc::new(ChannelPool::with_config(client_transport, self.pool_config));
        let mut call = ServiceCall::new(router, pool)
            .with_codecs(self.codecs)
            .with_timeout(self.config.default_timeout);
        if let Some(metrics) = self.metrics {
            call = call.with_metrics(metrics);
        }

        info!(
            "Node {} started with {} services ({} qualifiers)",
            handle.address(),
            services.len(),
            dispatch.len()
        );

        Ok(ServiceNode {
            config: self.config,
            registry,
            dispatch,
            call,
            handle,
            services: services.into_iter().map(|(descriptor, _)| descriptor).collect(),
        })
    }
}

/// Builds the registry around the bound address and registers local services.
fn register(
    handle: &ServerHandle,
    config: &NodeConfig,
    services: &[(ServiceDescriptor, BTreeMap<String, String>)],
) -> Result<ServiceRegistry> {
    let (host, port) = split_address(handle.address())?;
    let mut endpoint =
        ServiceEndpoint::new(handle.address(), host, port).with_content_types(config.content_types.clone());
    for (key, value) in &config.tags {
        endpoint = endpoint.with_tag(key.clone(), value.clone());
    }

    let registry = ServiceRegistry::new(endpoint);
    for (descriptor, tags) in services {
        registry.register_local(descriptor, tags)?;
    }
    Ok(registry)
}

fn split_address(address: &str) -> Result<(&str, u16)> {
    address
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host, port.parse().ok()?)))
        .ok_or_else(|| MeshError::Transport(format!("Bound address {} has no port", address)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrpc_common::ServiceMessage;
    use serde_json::json;

    fn greeting() -> ServiceBinding {
        ServiceBinding::builder("greeting")
            .request_response("hello", |name: String| async move { Ok(format!("hello {}", name)) })
            .build()
            .unwrap()
    }

    struct Both;

    impl ServiceProvider for Both {
        fn bindings(self: Arc<Self>) -> Result<Vec<ServiceBinding>> {
            Ok(vec![
                greeting(),
                ServiceBinding::builder("echo")
                    .request_response("echo", |value: serde_json::Value| async move { Ok(value) })
                    .tag("zone", "eu")
                    .build()?,
            ])
        }
    }

    #[test]
    fn test_split_address() {
        assert_eq!(split_address("127.0.0.1:4801").unwrap(), ("127.0.0.1", 4801));
        assert_eq!(split_address("node-a:20000").unwrap(), ("node-a", 20000));
        assert!(split_address("no-port").is_err());
        assert!(split_address("host:port").is_err());
    }

    #[tokio::test]
    async fn test_start_registers_local_services() {
        let transport = LocalTransport::new();
        let node = ServiceNode::builder()
            .config(NodeConfig::default().with_host("node-a").with_tag("dc", "1"))
            .service(Arc::new(Both))
            .transport(transport.clone())
            .start()
            .await
            .unwrap();

        assert_eq!(node.address(), "node-a:20000");
        assert_eq!(node.id(), node.address());
        assert_eq!(transport.addresses(), vec!["node-a:20000".to_string()]);
        assert_eq!(node.services().len(), 2);

        let references = node.registry().list_service_references(Some("echo"));
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].tag("zone"), Some("eu"));
        assert_eq!(references[0].tag("dc"), Some("1"));
    }

    #[tokio::test]
    async fn test_calls_own_service() {
        let node = ServiceNode::builder()
            .config(NodeConfig::default().with_host("node-a"))
            .binding(greeting())
            .transport(LocalTransport::new())
            .start()
            .await
            .unwrap();

        let request = ServiceMessage::new(Qualifier::parse("greeting/hello").unwrap()).with_value(json!("joe"));
        let reply: String = node.call().request_response_as(request).await.unwrap();
        assert_eq!(reply, "hello joe");
    }

    #[tokio::test]
    async fn test_metadata_round_trips_into_other_registry() {
        let transport = LocalTransport::new();
        let a = ServiceNode::builder()
            .config(NodeConfig::default().with_host("node-a"))
            .binding(greeting())
            .transport(transport.clone())
            .start()
            .await
            .unwrap();
        let b = ServiceNode::builder()
            .config(NodeConfig::default().with_host("node-b"))
            .transport(transport)
            .start()
            .await
            .unwrap();

        b.on_membership_event(&a.announcement().unwrap());
        let endpoint = b.registry().endpoint_for_qualifier(&Qualifier::parse("greeting/hello").unwrap());
        assert_eq!(endpoint.map(|e| e.id.clone()), Some(a.id().to_string()));
    }

    #[tokio::test]
    async fn test_duplicate_service_fails_before_binding() {
        let transport = LocalTransport::new();
        let result = ServiceNode::builder()
            .config(NodeConfig::default().with_host("node-a"))
            .binding(greeting())
            .binding(greeting())
            .transport(transport.clone())
            .start()
            .await;

        assert!(matches!(result, Err(MeshError::Definition(_))));
        assert!(transport.addresses().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_unbinds() {
        let transport = LocalTransport::new();
        let node = ServiceNode::builder()
            .config(NodeConfig::default().with_host("node-a"))
            .binding(greeting())
            .transport(transport.clone())
            .start()
            .await
            .unwrap();

        node.shutdown();
        assert!(transport.addresses().is_empty());
    }
}
