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
use std::collections::HashMap;

/// Metrics for one qualifier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualifierMetrics {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p95_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Routing decisions that landed on one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub endpoint_id: String,
    pub route_count: u64,
    pub last_route_ms: u64,
}

impl EndpointMetrics {
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
            route_count: 0,
            last_route_ms: 0,
        }
    }
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub timed_out_calls: u64,
    pub uptime_ms: u64,
    pub qualifiers: HashMap<String, QualifierMetrics>,
    pub endpoints: HashMap<String, EndpointMetrics>,
}

impl MetricsSnapshot {
    pub fn new(uptime_ms: u64) -> Self {
        Self {
            uptime_ms,
            ..Self::default()
        }
    }

    /// Share of routing decisions per endpoint, in `0.0..=1.0`.
    pub fn route_shares(&self) -> HashMap<String, f64> {
        let total: u64 = self.endpoints.values().map(|e| e.route_count).sum();
        if total == 0 {
            return HashMap::new();
        }
        self.endpoints
            .iter()
            .map(|(id, e)| (id.clone(), e.route_count as f64 / total as f64))
            .collect()
    }
}
