//! # MeshRPC
//!
//! Location-transparent RPC between microservices.
//!
//! This crate re-exports the workspace crates under one roof:
//!
//! - [`common`]: qualifiers, messages, descriptors and the transport boundary
//! - [`registry`]: cluster view, membership events and routers
//! - [`metrics`]: call and routing counters
//! - [`client`]: the invocation pipeline and typed stubs
//! - [`server`]: service bindings, dispatch and nodes
//!
//! # Example
//!
//! ```rust,no_run
//! use meshrpc::server::{NodeConfig, ServiceBinding, ServiceNode};
//! use meshrpc::common::ServiceDescriptor;
//!
//! # async fn example() -> meshrpc::common::Result<()> {
//! let binding = ServiceBinding::builder("io.example.Greeting")
//!     .request_response("greeting", |name: String| async move { Ok(format!("hello {}", name)) })
//!     .build()?;
//! let descriptor: ServiceDescriptor = binding.descriptor().clone();
//!
//! let node = ServiceNode::builder()
//!     .config(NodeConfig::default().with_port(4801))
//!     .binding(binding)
//!     .start()
//!     .await?;
//!
//! let hello = node.api(&descriptor).request_response::<String, String>("greeting")?;
//! assert_eq!(hello.call("joe".to_string()).await?, "hello joe");
//! # Ok(())
//! # }
//! ```

pub use meshrpc_client as client;
pub use meshrpc_common as common;
pub use meshrpc_metrics as metrics;
pub use meshrpc_registry as registry;
pub use meshrpc_server as server;

pub use meshrpc_client::{ServiceCall, ServiceProxy};
pub use meshrpc_common::{CommunicationMode, MeshError, Qualifier, Result, ServiceDescriptor, ServiceMessage};
pub use meshrpc_registry::{MembershipEvent, ServiceRegistry};
pub use meshrpc_server::{NodeConfig, ServiceBinding, ServiceNode};
