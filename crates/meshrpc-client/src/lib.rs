//! MeshRPC Client
//!
//! The invocation side of MeshRPC: [`ServiceCall`] routes a message to one
//! endpoint, sends it over a pooled channel and maps the reply or failure;
//! [`ServiceProxy`] puts typed per-method handles on top of it.

pub mod call;
pub mod pool;
pub mod proxy;
pub mod stream;

pub use call::{ServiceCall, DEFAULT_TIMEOUT};
pub use pool::{ChannelPool, PoolConfig};
pub use proxy::{
    FireAndForgetMethod, OneWayMethod, RawMethod, RequestResponseMethod, RequestStreamMethod,
    ServiceProxy,
};
pub use stream::ResponseStream;
