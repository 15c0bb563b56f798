//! Request-Stream and One-Way Tests
//!
//! Streams between two nodes: ordering, early termination and
//! cancellation. Also covers calls that expect no reply.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use meshrpc::common::transport::LocalTransport;
use meshrpc::{MeshError, NodeConfig, ServiceBinding, ServiceDescriptor, ServiceNode};

// ============================================================================
// Test fixtures
// ============================================================================

struct Counters {
    produced: Arc<AtomicUsize>,
    received: Arc<AtomicUsize>,
}

fn numbers(counters: &Counters) -> ServiceBinding {
    let produced = counters.produced.clone();
    let received = counters.received.clone();
    ServiceBinding::builder("io.example.Numbers")
        .request_stream("count", |n: u32| stream::iter((0..n).map(Ok)))
        .request_stream("endless", move |_: ()| {
            let produced = produced.clone();
            stream::unfold(0u64, move |i| {
                let produced = produced.clone();
                async move {
                    produced.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some((Ok(i), i + 1))
                }
            })
        })
        .request_stream("failing", |_: ()| {
            stream::iter(vec![
                Ok(1u32),
                Err(MeshError::application(409, "conflict")),
                Ok(2u32),
            ])
        })
        .one_way("record", move |n: usize| {
            let received = received.clone();
            async move {
                received.fetch_add(n, Ordering::SeqCst);
                Ok(())
            }
        })
        .build()
        .unwrap()
}

async fn pair(counters: &Counters) -> (ServiceNode, ServiceNode, ServiceDescriptor) {
    let transport = LocalTransport::new();
    let binding = numbers(counters);
    let descriptor = binding.descriptor().clone();
    let server = ServiceNode::builder()
        .config(NodeConfig::default().with_host("node-a"))
        .binding(binding)
        .transport(transport.clone())
        .start()
        .await
        .unwrap();
    let caller = ServiceNode::builder()
        .config(NodeConfig::default().with_host("node-b"))
        .transport(transport)
        .start()
        .await
        .unwrap();
    caller.on_membership_event(&server.announcement().unwrap());
    (server, caller, descriptor)
}

fn counters() -> Counters {
    Counters {
        produced: Arc::new(AtomicUsize::new(0)),
        received: Arc::new(AtomicUsize::new(0)),
    }
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn test_stream_preserves_order() {
    let counters = counters();
    let (_server, caller, descriptor) = pair(&counters).await;

    let count = caller
        .api(&descriptor)
        .request_stream::<u32, u32>("count")
        .unwrap();
    let values: Vec<u32> = count
        .call(10)
        .await
        .unwrap()
        .map(|item| item.unwrap())
        .collect()
        .await;

    assert_eq!(values, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_empty_stream_completes() {
    let counters = counters();
    let (_server, caller, descriptor) = pair(&counters).await;

    let count = caller.api(&descriptor).request_stream::<u32, u32>("count").unwrap();
    let mut responses = count.call(0).await.unwrap();

    assert!(responses.next().await.is_none());
    assert!(responses.is_terminated());
}

#[tokio::test]
async fn test_stream_ends_after_first_error() {
    let counters = counters();
    let (_server, caller, descriptor) = pair(&counters).await;

    let failing = caller.api(&descriptor).request_stream::<(), u32>("failing").unwrap();
    let items: Vec<_> = failing.call(()).await.unwrap().collect().await;

    assert_eq!(items.len(), 2);
    assert_eq!(*items[0].as_ref().unwrap(), 1);
    assert!(matches!(
        items[1],
        Err(MeshError::Application { code: 409, .. })
    ));
}

#[tokio::test]
async fn test_cancel_stops_the_producer() {
    let counters = counters();
    let (_server, caller, descriptor) = pair(&counters).await;

    let endless = caller.api(&descriptor).request_stream::<(), u64>("endless").unwrap();
    let mut responses = endless.call(()).await.unwrap();

    let first: Vec<u64> = (&mut responses).take(3).map(|item| item.unwrap()).collect().await;
    assert_eq!(first, vec![0, 1, 2]);

    responses.cancel();
    assert!(responses.is_terminated());
    assert!(responses.next().await.is_none());

    let produced = counters.produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.produced.load(Ordering::SeqCst), produced);
}

// ============================================================================
// No-reply calls
// ============================================================================

#[tokio::test]
async fn test_one_way_reaches_remote_handler() {
    let counters = counters();
    let (_server, caller, descriptor) = pair(&counters).await;

    let record = caller.api(&descriptor).one_way::<usize>("record").unwrap();
    record.call(3).await.unwrap();
    record.call(4).await.unwrap();

    for _ in 0..50 {
        if counters.received.load(Ordering::SeqCst) == 7 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("one-way calls were not delivered");
}
