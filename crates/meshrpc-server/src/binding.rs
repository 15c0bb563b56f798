//! Explicit service bindings.
//!
//! A [`ServiceBinding`] ties each method of one service to the handler that
//! serves it. Bindings are built once, when a node starts, and produce both
//! the [`ServiceDescriptor`] announced to the cluster and the invokers the
//! dispatch table calls.
//!
//! # Example
//!
//! ```rust
//! use meshrpc_server::ServiceBinding;
//!
//! let binding = ServiceBinding::builder("io.example.Greeting")
//!     .request_response("greeting", |name: String| async move {
//!         Ok(format!("hello {}", name))
//!     })
//!     .fire_and_forget("ping", || async { Ok(()) })
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(binding.descriptor().name(), "io.example.Greeting");
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;
use meshrpc_common::protocol::error::{MeshError, Result};
use meshrpc_common::{CommunicationMode, Qualifier, ServiceDescriptor, ServiceDescriptorBuilder, ServiceMessage, TypeTag};
use serde::de::DeserializeOwned;
use serde::Serialize;

type Handler<T> = Arc<dyn Fn(ServiceMessage) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type StreamHandler = Arc<dyn Fn(ServiceMessage) -> BoxStream<'static, Result<ServiceMessage>> + Send + Sync>;

/// A bound handler, fed with decoded request messages.
#[derive(Clone)]
pub(crate) enum Invoker {
    /// Fire-and-forget and one-way methods.
    NoReply(Handler<()>),
    RequestResponse(Handler<ServiceMessage>),
    RequestStream(StreamHandler),
}

impl Invoker {
    pub(crate) fn mode_name(&self) -> &'static str {
        match self {
            Invoker::NoReply(_) => "no-reply",
            Invoker::RequestResponse(_) => CommunicationMode::RequestResponse.as_str(),
            Invoker::RequestStream(_) => CommunicationMode::RequestStream.as_str(),
        }
    }
}

fn decode<Req: DeserializeOwned>(message: &ServiceMessage) -> Result<Req> {
    message
        .data_as::<Req>()
        .map_err(|e| MeshError::Codec(format!("bad payload for {}: {}", message.qualifier(), e)))
}

fn reply<Resp: Serialize>(qualifier: &Qualifier, response: &Resp) -> Result<ServiceMessage> {
    ServiceMessage::new(qualifier.clone()).with_data(response)
}

/// One service with a handler per method.
pub struct ServiceBinding {
    descriptor: ServiceDescriptor,
    invokers: HashMap<Qualifier, Invoker>,
    tags: BTreeMap<String, String>,
}

impl ServiceBinding {
    pub fn builder(name: impl Into<String>) -> ServiceBindingBuilder {
        ServiceBindingBuilder::new(name)
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Tags announced with every method of this service.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub(crate) fn into_invokers(self) -> HashMap<Qualifier, Invoker> {
        self.invokers
    }
}

impl std::fmt::Debug for ServiceBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBinding")
            .field("descriptor", &self.descriptor)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

/// Builder for [`ServiceBinding`].
///
/// Each method is declared together with its handler, so a method cannot be
/// announced without something to serve it. Definition errors surface from
/// [`build`](Self::build).
pub struct ServiceBindingBuilder {
    descriptor: ServiceDescriptorBuilder,
    name: String,
    invokers: Vec<(String, Box<dyn FnOnce(Qualifier) -> Invoker + Send>)>,
    tags: BTreeMap<String, String>,
}

impl ServiceBindingBuilder {
    fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            descriptor: ServiceDescriptor::builder(name.clone()),
            name,
            invokers: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Method without argument or reply.
    pub fn fire_and_forget<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let method = method.into();
        self.descriptor = self.descriptor.fire_and_forget(method.clone());
        let handler = Arc::new(handler);
        self.invokers.push((
            method,
            Box::new(move |_: Qualifier| Invoker::NoReply(Arc::new(move |_: ServiceMessage| handler().boxed()))),
        ));
        self
    }

    /// Method with one argument and no reply.
    pub fn one_way<Req, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let method = method.into();
        self.descriptor = self.descriptor.one_way::<Req>(method.clone());
        let handler = Arc::new(handler);
        self.invokers.push((
            method,
            Box::new(move |_: Qualifier| {
                Invoker::NoReply(Arc::new(move |message: ServiceMessage| match decode::<Req>(&message) {
                    Ok(request) => handler(request).boxed(),
                    Err(e) => futures::future::ready(Err(e)).boxed(),
                }))
            }),
        ));
        self
    }

    /// Method with exactly one reply.
    ///
    /// Use `()` as `Req` for a method without argument.
    pub fn request_response<Req, Resp, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
    {
        let method = method.into();
        self.descriptor = self.descriptor.request_response::<Req, Resp>(method.clone());
        let handler = Arc::new(handler);
        self.invokers.push((
            method,
            Box::new(move |qualifier: Qualifier| {
                Invoker::RequestResponse(Arc::new(move |message: ServiceMessage| {
                    let request = match decode::<Req>(&message) {
                        Ok(request) => request,
                        Err(e) => return futures::future::ready(Err(e)).boxed(),
                    };
                    let qualifier = qualifier.clone();
                    let response = handler(request);
                    async move { reply(&qualifier, &response.await?) }.boxed()
                }))
            }),
        ));
        self
    }

    /// Method with a reply stream. Elements are sent in the order the
    /// stream yields them; an error element ends the stream.
    pub fn request_stream<Req, Resp, F, S>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Resp>> + Send + 'static,
    {
        let method = method.into();
        self.descriptor = self.descriptor.request_stream::<Req, Resp>(method.clone());
        let handler = Arc::new(handler);
        self.invokers.push((
            method,
            Box::new(move |qualifier: Qualifier| {
                Invoker::RequestStream(Arc::new(move |message: ServiceMessage| {
                    let request = match decode::<Req>(&message) {
                        Ok(request) => request,
                        Err(e) => return futures::stream::once(futures::future::ready(Err(e))).boxed(),
                    };
                    let qualifier = qualifier.clone();
                    handler(request)
                        .map(move |item| item.and_then(|response| reply(&qualifier, &response)))
                        .boxed()
                }))
            }),
        ));
        self
    }

    /// Request-response method working on envelopes.
    ///
    /// The handler sees the decoded request with all its headers and may
    /// set headers on the reply. Request and response are untyped.
    pub fn request_response_raw<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ServiceMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ServiceMessage>> + Send + 'static,
    {
        let method = method.into();
        self.descriptor = self
            .descriptor
            .request_response::<ServiceMessage, ServiceMessage>(method.clone());
        let handler = Arc::new(handler);
        self.invokers.push((
            method,
            Box::new(move |qualifier: Qualifier| {
                Invoker::RequestResponse(Arc::new(move |message: ServiceMessage| {
                    let qualifier = qualifier.clone();
                    let response = handler(message);
                    async move { Ok(response.await?.with_qualifier(qualifier)) }.boxed()
                }))
            }),
        ));
        self
    }

    /// Overrides the request type announced for `method`.
    pub fn request_type(mut self, method: impl Into<String>, tag: TypeTag) -> Self {
        self.descriptor = self.descriptor.request_type(method, tag);
        self
    }

    /// Adds a tag to every registration of this service.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<ServiceBinding> {
        let descriptor = self.descriptor.build()?;
        let mut invokers = HashMap::new();
        for (method, bind) in self.invokers {
            let qualifier = descriptor
                .method(&method)
                .map(|m| m.qualifier().clone())
                .ok_or_else(|| MeshError::Definition(format!("{}: unknown method '{}'", self.name, method)))?;
            invokers.insert(qualifier.clone(), bind(qualifier));
        }
        Ok(ServiceBinding {
            descriptor,
            invokers,
            tags: self.tags,
        })
    }
}

/// Something that hosts one or more services.
///
/// An implementation may expose several services; each binding is
/// registered on its own.
pub trait ServiceProvider: Send + Sync {
    fn bindings(self: Arc<Self>) -> Result<Vec<ServiceBinding>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn q(s: &str) -> Qualifier {
        Qualifier::parse(s).unwrap()
    }

    fn request(s: &str, value: serde_json::Value) -> ServiceMessage {
        ServiceMessage::new(q(s)).with_value(value)
    }

    #[test]
    fn test_builds_descriptor_from_handlers() {
        let binding = ServiceBinding::builder("greeting")
            .request_response("hello", |name: String| async move { Ok(format!("hello {}", name)) })
            .request_stream("many", |n: u32| futures::stream::iter((0..n).map(Ok)))
            .one_way("log", |_line: String| async { Ok(()) })
            .fire_and_forget("ping", || async { Ok(()) })
            .tag("zone", "eu")
            .build()
            .unwrap();

        let descriptor = binding.descriptor();
        assert_eq!(descriptor.methods().count(), 4);
        assert_eq!(descriptor.method("hello").unwrap().mode(), CommunicationMode::RequestResponse);
        assert_eq!(descriptor.method("many").unwrap().mode(), CommunicationMode::RequestStream);
        assert_eq!(descriptor.method("log").unwrap().mode(), CommunicationMode::OneWay);
        assert_eq!(descriptor.method("ping").unwrap().mode(), CommunicationMode::FireAndForget);
        assert_eq!(binding.tags().get("zone").map(String::as_str), Some("eu"));
        assert_eq!(binding.into_invokers().len(), 4);
    }

    #[test]
    fn test_duplicate_method_is_definition_error() {
        let result = ServiceBinding::builder("greeting")
            .request_response("hello", |name: String| async move { Ok(name) })
            .request_response("hello", |name: String| async move { Ok(name) })
            .build();
        assert!(matches!(result, Err(MeshError::Definition(_))));
    }

    #[test]
    fn test_unknown_request_type_override_fails() {
        let result = ServiceBinding::builder("greeting")
            .request_response("hello", |name: String| async move { Ok(name) })
            .request_type("missing", TypeTag::named("Other"))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_request_response_invoker() {
        let mut invokers = ServiceBinding::builder("greeting")
            .request_response("hello", |name: String| async move { Ok(format!("hello {}", name)) })
            .build()
            .unwrap()
            .into_invokers();

        let Some(Invoker::RequestResponse(handler)) = invokers.remove(&q("greeting/hello")) else {
            panic!("expected request-response invoker");
        };
        let reply = handler(request("greeting/hello", json!("joe"))).await.unwrap();
        assert_eq!(reply.qualifier(), &q("greeting/hello"));
        assert_eq!(reply.data_as::<String>().unwrap(), "hello joe");

        let bad = handler(request("greeting/hello", json!(42))).await;
        assert!(matches!(bad, Err(MeshError::Codec(_))));
    }

    #[tokio::test]
    async fn test_request_stream_invoker() {
        let mut invokers = ServiceBinding::builder("counter")
            .request_stream("count", |n: u32| futures::stream::iter((1..=n).map(Ok)))
            .build()
            .unwrap()
            .into_invokers();

        let Some(Invoker::RequestStream(handler)) = invokers.remove(&q("counter/count")) else {
            panic!("expected request-stream invoker");
        };
        let values: Vec<u32> = handler(request("counter/count", json!(3)))
            .map(|item| item.unwrap().data_as::<u32>().unwrap())
            .collect()
            .await;
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_raw_invoker_keeps_headers() {
        let mut invokers = ServiceBinding::builder("echo")
            .request_response_raw("raw", |message: ServiceMessage| async move {
                let trace = message.header("x-trace").unwrap_or_default().to_string();
                Ok(message.with_header("x-trace-reply", trace))
            })
            .build()
            .unwrap()
            .into_invokers();

        let Some(Invoker::RequestResponse(handler)) = invokers.remove(&q("echo/raw")) else {
            panic!("expected request-response invoker");
        };
        let reply = handler(request("echo/raw", json!({})).with_header("x-trace", "t-1"))
            .await
            .unwrap();
        assert_eq!(reply.header("x-trace-reply"), Some("t-1"));
    }
}
