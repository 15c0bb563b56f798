//! One-shot calls against a known endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use meshrpc_client::{ChannelPool, ServiceCall};
use meshrpc_common::protocol::error::{MeshError, Result};
use meshrpc_common::transport::{ClientTransport, Exchange};
use meshrpc_common::{CommunicationMode, MethodDescriptor, Payload, Qualifier, ServiceMessage, TypeTag};
use meshrpc_registry::membership::encode_endpoint;
use meshrpc_registry::{
    Member, MembershipEvent, RoundRobinRouter, ServiceEndpoint, ServiceRegistration, ServiceRegistry,
};
use serde_json::Value;

/// Id the CLI registers itself under. It hosts nothing.
const CLI_ENDPOINT_ID: &str = "meshrpc-cli";

#[derive(Debug, Clone)]
pub struct CallRequest {
    /// `host:port` of the member serving the qualifier
    pub endpoint: String,
    pub qualifier: Qualifier,
    pub data: Value,
    pub mode: CommunicationMode,
    pub timeout: Duration,
}

/// Calls `request.qualifier` on `request.endpoint`.
///
/// The endpoint is announced to a private registry as if gossip had found
/// it, so the call takes the regular routing path. Returns the response
/// payloads in order: none for one-way shapes, one for request-response,
/// every element for streams.
pub async fn call(request: CallRequest, transport: Arc<dyn ClientTransport>) -> Result<Vec<Value>> {
    let registry = Arc::new(ServiceRegistry::new(ServiceEndpoint::new(
        CLI_ENDPOINT_ID,
        "127.0.0.1",
        0,
    )));
    registry.on_membership_event(&announce(&request)?);

    let router = Arc::new(RoundRobinRouter::new(registry));
    let pool = Arc::new(ChannelPool::new(transport));
    let call = ServiceCall::new(router, pool).with_timeout(request.timeout);

    let message = match request.mode {
        CommunicationMode::FireAndForget => ServiceMessage::new(request.qualifier.clone()),
        _ => ServiceMessage::new(request.qualifier.clone()).with_value(request.data.clone()),
    };

    match call.invoke(message, request.mode).await? {
        Exchange::None => Ok(Vec::new()),
        Exchange::Single(reply) => Ok(vec![payload(reply)]),
        Exchange::Stream(mut stream) => {
            let mut values = Vec::new();
            while let Some(element) = stream.next().await {
                values.push(payload(element?));
            }
            Ok(values)
        }
    }
}

/// Membership event describing the target as serving exactly one method.
fn announce(request: &CallRequest) -> Result<MembershipEvent> {
    let (host, port) = request
        .endpoint
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
        .ok_or_else(|| MeshError::Definition(format!("Endpoint must be host:port, got {}", request.endpoint)))?;

    let (parameter_type, response_type) = match request.mode {
        CommunicationMode::FireAndForget => (TypeTag::UNIT, TypeTag::UNIT),
        CommunicationMode::OneWay => (TypeTag::DYNAMIC, TypeTag::UNIT),
        _ => (TypeTag::DYNAMIC, TypeTag::DYNAMIC),
    };
    let method = MethodDescriptor::from_tags(request.qualifier.clone(), request.mode, parameter_type, response_type)?;

    let endpoint = ServiceEndpoint::new(request.endpoint.clone(), host, port)
        .with_registration(ServiceRegistration::from_method(&method, &BTreeMap::new()));
    let member = Member::new(request.endpoint.clone(), host, port);
    Ok(MembershipEvent::added(member, encode_endpoint(&endpoint)))
}

fn payload(message: ServiceMessage) -> Value {
    match message.data() {
        Payload::Value(value) => value.clone(),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{EchoService, SERVICE_NAME};
    use meshrpc_common::transport::LocalTransport;
    use meshrpc_server::ServiceNode;
    use serde_json::json;

    // ============================================================================
    // Helpers
    // ============================================================================

    async fn echo_node(transport: &LocalTransport) -> ServiceNode {
        ServiceNode::builder()
            .service(Arc::new(EchoService))
            .transport(transport.clone())
            .start()
            .await
            .unwrap()
    }

    fn request(endpoint: &str, method: &str, data: Value, mode: CommunicationMode) -> CallRequest {
        CallRequest {
            endpoint: endpoint.to_string(),
            qualifier: Qualifier::new(SERVICE_NAME, method).unwrap(),
            data,
            mode,
            timeout: Duration::from_secs(5),
        }
    }

    // ============================================================================
    // Calls
    // ============================================================================

    #[tokio::test]
    async fn test_request_response() {
        let transport = LocalTransport::new();
        let node = echo_node(&transport).await;

        let values = call(
            request(node.address(), "echo", json!({"a": 1}), CommunicationMode::RequestResponse),
            Arc::new(transport),
        )
        .await
        .unwrap();

        assert_eq!(values, vec![json!({"a": 1})]);
    }

    #[tokio::test]
    async fn test_stream_collects_every_element() {
        let transport = LocalTransport::new();
        let node = echo_node(&transport).await;

        let values = call(
            request(
                node.address(),
                "repeat",
                json!({"text": "hi", "count": 3}),
                CommunicationMode::RequestStream,
            ),
            Arc::new(transport),
        )
        .await
        .unwrap();

        assert_eq!(values, vec![json!("hi"), json!("hi"), json!("hi")]);
    }

    #[tokio::test]
    async fn test_one_way_returns_nothing() {
        let transport = LocalTransport::new();
        let node = echo_node(&transport).await;

        let values = call(
            request(node.address(), "log", json!("hello"), CommunicationMode::OneWay),
            Arc::new(transport),
        )
        .await
        .unwrap();

        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_found() {
        let transport = LocalTransport::new();
        let node = echo_node(&transport).await;

        let err = call(
            request(node.address(), "missing", Value::Null, CommunicationMode::RequestResponse),
            Arc::new(transport),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MeshError::ServiceNotFound(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_rejects_endpoint_without_port() {
        let err = call(
            request("localhost", "echo", Value::Null, CommunicationMode::RequestResponse),
            Arc::new(LocalTransport::new()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, MeshError::Definition(_)));
    }
}
