//! Routing Tests
//!
//! Canary splits, tag filters and sticky routing between real nodes.

use std::collections::HashMap;
use std::sync::Arc;

use meshrpc::common::transport::LocalTransport;
use meshrpc::registry::{AffinityRouter, RoutingContext, TagRouter};
use meshrpc::{MeshError, NodeConfig, ServiceBinding, ServiceCall, ServiceDescriptor, ServiceNode};

// ============================================================================
// Test fixtures
// ============================================================================

fn greeting(node_name: &'static str) -> ServiceBinding {
    ServiceBinding::builder("io.example.Greeting")
        .request_response("whoami", move |_: ()| async move { Ok(node_name.to_string()) })
        .build()
        .unwrap()
}

fn descriptor() -> ServiceDescriptor {
    greeting("any").descriptor().clone()
}

async fn start(transport: &LocalTransport, config: NodeConfig, binding: Option<ServiceBinding>) -> ServiceNode {
    let mut builder = ServiceNode::builder().config(config).transport(transport.clone());
    if let Some(binding) = binding {
        builder = builder.binding(binding);
    }
    builder.start().await.unwrap()
}

/// Stable `a` at weight 0.7, canary `b` at weight 0.3, and a caller that knows both.
async fn canary_cluster(transport: &LocalTransport) -> (ServiceNode, ServiceNode, ServiceNode) {
    let stable = NodeConfig::default()
        .with_host("node-a")
        .with_tag("weight", "0.7")
        .with_tag("version", "stable");
    let canary = NodeConfig::default()
        .with_host("node-b")
        .with_tag("weight", "0.3")
        .with_tag("version", "canary");

    let a = start(transport, stable, Some(greeting("a"))).await;
    let b = start(transport, canary, Some(greeting("b"))).await;
    let caller = start(transport, NodeConfig::default().with_host("node-c"), None).await;
    caller.on_membership_event(&a.announcement().unwrap());
    caller.on_membership_event(&b.announcement().unwrap());
    (a, b, caller)
}

async fn tally(call: ServiceCall, calls: usize) -> HashMap<String, usize> {
    let whoami = call
        .api(&descriptor())
        .request_response::<(), String>("whoami")
        .unwrap();
    let mut counts = HashMap::new();
    for _ in 0..calls {
        *counts.entry(whoami.call(()).await.unwrap()).or_insert(0) += 1;
    }
    counts
}

// ============================================================================
// Tag router
// ============================================================================

#[tokio::test]
async fn test_weighted_canary_split() {
    let transport = LocalTransport::new();
    let (_a, _b, caller) = canary_cluster(&transport).await;

    let router = Arc::new(TagRouter::new(caller.registry().clone()));
    let counts = tally(caller.call().with_router(router), 1000).await;

    let stable = counts.get("a").copied().unwrap_or(0);
    assert_eq!(stable + counts.get("b").copied().unwrap_or(0), 1000);
    assert!((600..=800).contains(&stable), "stable got {} of 1000", stable);
}

#[tokio::test]
async fn test_required_tag_pins_the_canary() {
    let transport = LocalTransport::new();
    let (_a, _b, caller) = canary_cluster(&transport).await;

    let router = Arc::new(TagRouter::new(caller.registry().clone()));
    let call = caller
        .call()
        .with_router(router)
        .with_context(RoutingContext::new().with_tag("version", "canary"));
    let counts = tally(call, 20).await;

    assert_eq!(counts.get("b"), Some(&20));
    assert_eq!(counts.len(), 1);
}

#[tokio::test]
async fn test_required_tag_without_match_is_not_found() {
    let transport = LocalTransport::new();
    let (_a, _b, caller) = canary_cluster(&transport).await;

    let router = Arc::new(TagRouter::new(caller.registry().clone()));
    let call = caller
        .call()
        .with_router(router)
        .with_context(RoutingContext::new().with_tag("version", "nightly"));
    let whoami = call.api(&descriptor()).request_response::<(), String>("whoami").unwrap();

    assert!(matches!(
        whoami.call(()).await.unwrap_err(),
        MeshError::ServiceNotFound(_)
    ));
}

// ============================================================================
// Affinity router
// ============================================================================

#[tokio::test]
async fn test_affinity_key_sticks_to_one_endpoint() {
    let transport = LocalTransport::new();
    let (_a, _b, caller) = canary_cluster(&transport).await;

    let router = Arc::new(AffinityRouter::new(caller.registry().clone()));
    let call = caller
        .call()
        .with_router(router)
        .with_context(RoutingContext::new().with_affinity("session-42"));
    let counts = tally(call, 20).await;

    assert_eq!(counts.len(), 1);
    assert_eq!(counts.values().sum::<usize>(), 20);
}
