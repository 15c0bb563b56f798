// Copyright 2025 MeshRPC Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! MeshRPC Metrics Collection
//!
//! Thread-safe metrics for MeshRPC callers and hosting nodes: call counts per
//! qualifier, outcomes, latency percentiles and the distribution of routing
//! decisions across endpoints.
//!
//! # Architecture
//!
//! - [`MetricsSink`]: what the invocation pipeline and the dispatch table
//!   report into. [`NoopSink`] discards everything.
//! - [`MetricsRegistry`]: in-memory sink with atomic counters on the hot path
//! - [`MetricsSnapshot`]: serializable point-in-time view
//!
//! # Usage Example
//!
//! ```rust
//! use meshrpc_metrics::{CallOutcome, MetricsRegistry, MetricsSink};
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! let metrics = Arc::new(MetricsRegistry::new());
//!
//! let start = Instant::now();
//! // ... execute RPC call ...
//! metrics.record_call("greeting/hello", start, CallOutcome::Success);
//! metrics.record_route("greeting/hello", "10.0.0.1:4801");
//!
//! let snapshot = metrics.snapshot();
//! println!("Total calls: {}", snapshot.total_calls);
//! ```
//!
//! # Thread Safety
//!
//! All types are `Send + Sync` and meant to be shared through `Arc`.
//! Counters are lock-free atomics; the per-qualifier and per-endpoint tables
//! sit behind an `RwLock` that is only written when an entry is created or
//! during periodic cleanup.

mod registry;
mod sink;
mod snapshot;

pub use registry::{MetricsConfig, MetricsRegistry};
pub use sink::{CallOutcome, MetricsSink, NoopSink};
pub use snapshot::{EndpointMetrics, MetricsSnapshot, QualifierMetrics};
