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

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// How a single call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Success,
    Failure,
    Timeout,
}

impl CallOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, CallOutcome::Success)
    }
}

/// Observability sink for the invocation pipeline and the dispatch table.
///
/// A sink is constructed explicitly and handed to the components that report
/// into it; its lifetime is that of the hosting node. Having no sink at all
/// is a valid configuration.
///
/// # Example
///
/// ```rust
/// use meshrpc_metrics::{CallOutcome, MetricsRegistry, MetricsSink};
/// use std::time::Instant;
///
/// let sink = MetricsRegistry::new();
/// let start = Instant::now();
/// // ... perform the call ...
/// sink.record_call("greeting/hello", start, CallOutcome::Success);
/// assert_eq!(sink.snapshot().total_calls, 1);
/// ```
pub trait MetricsSink: Send + Sync {
    /// Records one finished call.
    ///
    /// # Arguments
    /// * `qualifier` - The `service/method` that was called
    /// * `start` - When the call began, used to derive its latency
    /// * `outcome` - How the call ended
    fn record_call(&self, qualifier: &str, start: Instant, outcome: CallOutcome);

    /// Records that the router picked `endpoint_id` for `qualifier`.
    fn record_route(&self, _qualifier: &str, _endpoint_id: &str) {}
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn record_call(&self, _qualifier: &str, _start: Instant, _outcome: CallOutcome) {}
}
