//! MeshRPC Service Registry and Routing
//!
//! Keeps track of which endpoint hosts which service methods and picks one
//! endpoint per call.
//!
//! # Components
//!
//! - [`ServiceRegistry`]: concurrent endpoint table fed by local registration
//!   and cluster membership events
//! - [`membership`]: event types and the endpoint announcement metadata format
//! - [`Router`]: per-call endpoint selection, with [`RoundRobinRouter`],
//!   [`TagRouter`] (tag filter plus weighted canary split), [`RandomRouter`]
//!   and [`AffinityRouter`]
//!
//! Routers read candidates from the registry on every call, so membership
//! changes take effect on the next call.

pub mod endpoint;
pub mod membership;
pub mod registry;
pub mod router;
pub mod tag_router;

pub use endpoint::{ServiceEndpoint, ServiceReference, ServiceRegistration};
pub use membership::{Member, MembershipEvent, MembershipEventKind};
pub use registry::ServiceRegistry;
pub use router::{AffinityRouter, RandomRouter, RoundRobinRouter, Router, RoutingContext};
pub use tag_router::{TagRouter, WEIGHT_TAG};
