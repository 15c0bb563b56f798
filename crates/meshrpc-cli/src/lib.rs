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

//! # MeshRPC CLI
//!
//! Command-line interface for MeshRPC.
//!
//! ## Key Commands
//!
//! - `meshrpc serve`: host the demo echo service on a TCP endpoint
//! - `meshrpc call`: call a qualifier on a given endpoint (outputs raw JSON,
//!   one line per response)
//!
//! There is no gossip layer in the CLI. `call` addresses one endpoint
//! directly by announcing it to a throwaway registry, then goes through the
//! regular routing and invocation pipeline.

pub mod demo;
pub mod invoke;
