//! MeshRPC Server
//!
//! This crate hosts services: explicit [`ServiceBinding`]s describe and serve
//! each method, the [`DispatchTable`] routes inbound messages to them, and a
//! [`ServiceNode`] ties dispatch, registry, transports and the client side
//! together into one cluster member.

pub mod binding;
pub mod config;
pub mod dispatch;
pub mod node;

pub use binding::{ServiceBinding, ServiceBindingBuilder, ServiceProvider};
pub use config::NodeConfig;
pub use dispatch::DispatchTable;
pub use node::{ServiceNode, ServiceNodeBuilder};
