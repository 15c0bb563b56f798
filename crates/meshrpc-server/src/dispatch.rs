use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use meshrpc_common::protocol::codes;
use meshrpc_common::protocol::error::{MeshError, Result};
use meshrpc_common::transport::{CodecRegistry, MessageHandler, MessageStream};
use meshrpc_common::{Qualifier, ServiceMessage, HEADER_CONTENT_TYPE};
use meshrpc_metrics::{CallOutcome, MetricsSink};
use tracing::{debug, warn};

use crate::binding::{Invoker, ServiceBinding};

/// Server-side mapping from qualifier to bound handler.
///
/// Every inbound message is resolved, decoded with the codec its
/// `content-type` names, handed to the handler and the result encoded back
/// with the same content type. Failures become error replies:
///
/// | failure | code |
/// |---|---|
/// | unknown qualifier | 404 |
/// | payload does not decode into the request type | 400 |
/// | call shape does not match the method | 400 |
/// | handler error | the error's own code, 500 for application errors |
/// | handler panic | 500 |
///
/// Fire-and-forget exchanges have nobody to reply to, so their failures
/// are only logged. No failure affects other invocations.
pub struct DispatchTable {
    invokers: HashMap<Qualifier, Invoker>,
    codecs: CodecRegistry,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            invokers: HashMap::new(),
            codecs: CodecRegistry::new(),
            metrics: None,
        }
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Adds every method of `binding`.
    ///
    /// # Errors
    ///
    /// [`MeshError::Definition`] if a qualifier is already bound. The table
    /// is left unchanged in that case.
    pub fn add(&mut self, binding: ServiceBinding) -> Result<()> {
        let invokers = binding.into_invokers();
        if let Some(taken) = invokers.keys().find(|q| self.invokers.contains_key(*q)) {
            return Err(MeshError::Definition(format!("{} is bound twice", taken)));
        }
        self.invokers.extend(invokers);
        Ok(())
    }

    pub fn contains(&self, qualifier: &Qualifier) -> bool {
        self.invokers.contains_key(qualifier)
    }

    /// Bound qualifiers, sorted.
    pub fn qualifiers(&self) -> Vec<Qualifier> {
        let mut qualifiers: Vec<Qualifier> = self.invokers.keys().cloned().collect();
        qualifiers.sort();
        qualifiers
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }

    /// Finds the handler and decodes the request for it.
    fn resolve(&self, message: ServiceMessage) -> Result<(Invoker, ServiceMessage)> {
        let invoker = self
            .invokers
            .get(message.qualifier())
            .cloned()
            .ok_or_else(|| MeshError::ServiceNotFound(message.qualifier().to_string()))?;
        let request = self.codecs.decode(message)?;
        Ok((invoker, request))
    }

    fn record<T>(&self, qualifier: &Qualifier, start: Instant, result: &Result<T>) {
        if let Some(metrics) = &self.metrics {
            let outcome = if result.is_ok() {
                CallOutcome::Success
            } else {
                CallOutcome::Failure
            };
            metrics.record_call(&qualifier.to_string(), start, outcome);
        }
    }
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchTable")
            .field("qualifiers", &self.qualifiers())
            .field("codecs", &self.codecs)
            .finish_non_exhaustive()
    }
}

fn panicked(qualifier: &Qualifier) -> MeshError {
    MeshError::application(codes::APPLICATION, format!("{} panicked", qualifier))
}

fn mismatch(qualifier: &Qualifier, invoker: &Invoker, requested: &str) -> MeshError {
    MeshError::application(
        codes::BAD_PAYLOAD,
        format!("{} is {}, not {}", qualifier, invoker.mode_name(), requested),
    )
}

/// Encodes a reply with the content type of its request.
fn encode_reply(codecs: &CodecRegistry, content_type: Option<&str>, response: ServiceMessage) -> ServiceMessage {
    let response = match (response.content_type(), content_type) {
        (None, Some(content_type)) => response.with_header(HEADER_CONTENT_TYPE, content_type),
        _ => response,
    };
    let qualifier = response.qualifier().clone();
    match codecs.encode(response) {
        Ok(encoded) => encoded,
        Err(e) => {
            warn!("Failed to encode reply of {}: {}", qualifier, e);
            let error = MeshError::application(codes::APPLICATION, e.to_string());
            encode_error(codecs, &qualifier, content_type, &error)
        }
    }
}

fn encode_error(
    codecs: &CodecRegistry,
    qualifier: &Qualifier,
    content_type: Option<&str>,
    error: &MeshError,
) -> ServiceMessage {
    let reply = ServiceMessage::error(qualifier.clone(), error.error_data());
    let reply = match content_type {
        Some(content_type) if codecs.get(content_type).is_some() => {
            reply.with_header(HEADER_CONTENT_TYPE, content_type)
        }
        _ => reply,
    };
    let fallback = reply.clone();
    codecs.encode(reply).unwrap_or(fallback)
}

/// Runs a handler, turning a panic into an application error.
async fn guarded<T>(
    qualifier: &Qualifier,
    call: impl FnOnce() -> BoxFuture<'static, Result<T>>,
) -> Result<T> {
    match AssertUnwindSafe(async move { call().await }).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(panicked(qualifier)),
    }
}

#[async_trait]
impl MessageHandler for DispatchTable {
    async fn fire_and_forget(&self, message: ServiceMessage) {
        let qualifier = message.qualifier().clone();
        let start = Instant::now();
        debug!("Dispatching fire-and-forget {}", qualifier);

        let result = match self.resolve(message) {
            Ok((Invoker::NoReply(handler), request)) => guarded(&qualifier, || handler(request)).await,
            Ok((Invoker::RequestResponse(handler), request)) => {
                guarded(&qualifier, || handler(request)).await.map(|_| ())
            }
            Ok((invoker, _)) => Err(mismatch(&qualifier, &invoker, "fire-and-forget")),
            Err(e) => Err(e),
        };

        self.record(&qualifier, start, &result);
        if let Err(e) = result {
            warn!("Fire-and-forget {} failed: {}", qualifier, e);
        }
    }

    async fn request_response(&self, message: ServiceMessage) -> ServiceMessage {
        let qualifier = message.qualifier().clone();
        let content_type = message.content_type().map(str::to_string);
        let start = Instant::now();
        debug!("Dispatching request-response {}", qualifier);

        let result = match self.resolve(message) {
            Ok((Invoker::RequestResponse(handler), request)) => guarded(&qualifier, || handler(request)).await,
            // Acknowledge no-reply methods with an empty reply.
            Ok((Invoker::NoReply(handler), request)) => guarded(&qualifier, || handler(request))
                .await
                .map(|()| ServiceMessage::new(qualifier.clone())),
            Ok((invoker, _)) => Err(mismatch(&qualifier, &invoker, "request-response")),
            Err(e) => Err(e),
        };

        self.record(&qualifier, start, &result);
        match result {
            Ok(response) => encode_reply(&self.codecs, content_type.as_deref(), response),
            Err(e) => {
                debug!("Replying to {} with error: {}", qualifier, e);
                encode_error(&self.codecs, &qualifier, content_type.as_deref(), &e)
            }
        }
    }

    fn request_stream(&self, message: ServiceMessage) -> MessageStream {
        let qualifier = message.qualifier().clone();
        let content_type = message.content_type().map(str::to_string);
        let start = Instant::now();
        debug!("Dispatching request-stream {}", qualifier);

        let opened = match self.resolve(message) {
            Ok((Invoker::RequestStream(handler), request)) => {
                std::panic::catch_unwind(AssertUnwindSafe(|| handler(request))).map_err(|_| panicked(&qualifier))
            }
            Ok((invoker, _)) => Err(mismatch(&qualifier, &invoker, "request-stream")),
            Err(e) => Err(e),
        };
        self.record(&qualifier, start, &opened);

        let elements = match opened {
            Ok(elements) => elements,
            Err(e) => {
                let reply = encode_error(&self.codecs, &qualifier, content_type.as_deref(), &e);
                return futures::stream::once(futures::future::ready(Ok(reply))).boxed();
            }
        };

        let codecs = self.codecs.clone();
        let panic_qualifier = qualifier.clone();
        AssertUnwindSafe(elements)
            .catch_unwind()
            .map(move |item| item.unwrap_or_else(|_| Err(panicked(&panic_qualifier))))
            .scan(false, |failed, item| {
                if *failed {
                    return futures::future::ready(None);
                }
                *failed = item.is_err();
                futures::future::ready(Some(item))
            })
            .map(move |item| {
                Ok(match item {
                    Ok(element) => encode_reply(&codecs, content_type.as_deref(), element),
                    Err(e) => encode_error(&codecs, &qualifier, content_type.as_deref(), &e),
                })
            })
            .boxed()
    }
}
