//! MeshRPC Common Types and Transport
//!
//! This crate provides the protocol definitions, service descriptors and the
//! transport boundary shared by every MeshRPC component.
//!
//! # Overview
//!
//! MeshRPC is a location-transparent microservices RPC framework: services
//! are described once, hosted on cluster nodes, and called through stubs
//! that route each call to one of the endpoints currently hosting them.
//! This crate contains the pieces every node needs:
//!
//! - **Protocol Layer**: [`Qualifier`], [`CommunicationMode`], [`ServiceMessage`], errors
//! - **Descriptor Layer**: [`ServiceDescriptor`] / [`MethodDescriptor`] built explicitly per service
//! - **Transport Layer**: channel traits, codecs, TCP and in-process transports
//!
//! # Wire Format
//!
//! - **Qualifier**: `"<serviceName>/<methodName>"`
//! - **TCP frame**: `[u32 BE frame length] [u32 BE header length] [JSON header] [payload]`
//! - **Payload codec**: selected by the `content-type` header, JSON by default
//!
//! # Example
//!
//! ```
//! use meshrpc_common::{Qualifier, ServiceMessage};
//! use serde_json::json;
//!
//! let q = Qualifier::parse("io.example.Greeting/greeting").unwrap();
//! let message = ServiceMessage::new(q).with_value(json!("joe"));
//! assert_eq!(message.data_as::<String>().unwrap(), "joe");
//! ```

pub mod descriptor;
pub mod protocol;
pub mod transport;

pub use descriptor::{MethodDescriptor, ServiceDescriptor, ServiceDescriptorBuilder, TypeTag};
pub use protocol::*;
