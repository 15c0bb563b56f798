use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshrpc_common::protocol::error::{MeshError, Result};
use meshrpc_common::transport::{ClientChannel, CodecRegistry, Exchange};
use meshrpc_common::{CommunicationMode, Qualifier, ServiceDescriptor, ServiceMessage, HEADER_CONTENT_TYPE};
use meshrpc_metrics::{CallOutcome, MetricsSink};
use meshrpc_registry::{Router, RoutingContext, ServiceReference};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::pool::ChannelPool;
use crate::proxy::ServiceProxy;
use crate::stream::ResponseStream;

/// Call timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The client-side invocation pipeline.
///
/// Every call goes through the same steps: ask the router for a target,
/// encode the message with a codec the target supports, acquire a channel
/// to the target's address from the pool, send, then decode the reply and
/// turn error replies into [`MeshError`]s.
///
/// A `ServiceCall` is cheap to clone; the `with_*` methods return a copy
/// with one setting changed, so per-call overrides never affect the
/// original.
///
/// # Errors
///
/// - [`MeshError::ServiceNotFound`] when the router has no candidate. No
///   channel is opened in that case.
/// - [`MeshError::Timeout`] when the reply does not arrive in time. The
///   server is not told; its late reply is discarded.
/// - [`MeshError::Application`] when the remote method failed.
/// - [`MeshError::Transport`] / [`MeshError::Connection`] when the channel
///   failed. The pooled channel is dropped and nothing is retried.
#[derive(Clone)]
pub struct ServiceCall {
    router: Arc<dyn Router>,
    pool: Arc<ChannelPool>,
    codecs: CodecRegistry,
    timeout: Duration,
    context: RoutingContext,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ServiceCall {
    pub fn new(router: Arc<dyn Router>, pool: Arc<ChannelPool>) -> Self {
        Self {
            router,
            pool,
            codecs: CodecRegistry::new(),
            timeout: DEFAULT_TIMEOUT,
            context: RoutingContext::default(),
            metrics: None,
        }
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = codecs;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_router(mut self, router: Arc<dyn Router>) -> Self {
        self.router = router;
        self
    }

    pub fn with_context(mut self, context: RoutingContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn context(&self) -> &RoutingContext {
        &self.context
    }

    pub fn codecs(&self) -> &CodecRegistry {
        &self.codecs
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    /// Client stub for `descriptor`, bound to this pipeline.
    pub fn api(&self, descriptor: &ServiceDescriptor) -> ServiceProxy {
        ServiceProxy::new(descriptor.clone(), self.clone())
    }

    /// Sends without waiting for any reply.
    ///
    /// Used for fire-and-forget and one-way methods. Completes once the
    /// message has been handed to the channel.
    pub async fn fire_and_forget(&self, message: ServiceMessage) -> Result<()> {
        let qualifier = message.qualifier().clone();
        let start = Instant::now();
        let result = self
            .with_deadline(async {
                let (address, channel, message) = self.connect(message).await?;
                let sent = channel.fire_and_forget(message).await;
                self.check(&address, &channel, sent).await
            })
            .await;
        self.record(&qualifier, start, &result);
        result
    }

    /// Sends and waits for exactly one reply, decoded but untyped.
    pub async fn request_response(&self, message: ServiceMessage) -> Result<ServiceMessage> {
        let qualifier = message.qualifier().clone();
        let start = Instant::now();
        let result = self
            .with_deadline(async {
                let (address, channel, message) = self.connect(message).await?;
                let reply = channel.request_response(message).await;
                let reply = self.check(&address, &channel, reply).await?;
                self.read_reply(&qualifier, reply)
            })
            .await;
        self.record(&qualifier, start, &result);
        result
    }

    /// Sends and decodes the single reply into `T`.
    pub async fn request_response_as<T: DeserializeOwned>(&self, message: ServiceMessage) -> Result<T> {
        let reply = self.request_response(message).await?;
        reply
            .data_as::<T>()
            .map_err(|e| MeshError::Codec(format!("cannot decode {}: {}", reply.qualifier(), e)))
    }

    /// Sends and returns the lazily decoded reply stream.
    ///
    /// The timeout covers opening the exchange, not the time between
    /// elements.
    pub async fn request_stream(&self, message: ServiceMessage) -> Result<ResponseStream<ServiceMessage>> {
        let qualifier = message.qualifier().clone();
        let inner = self.open_stream(message).await?;
        Ok(ResponseStream::raw(inner, self.codecs.clone(), qualifier))
    }

    /// Like [`request_stream`](Self::request_stream), decoding each element into `T`.
    pub async fn request_stream_as<T: DeserializeOwned>(
        &self,
        message: ServiceMessage,
    ) -> Result<ResponseStream<T>> {
        let qualifier = message.qualifier().clone();
        let inner = self.open_stream(message).await?;
        Ok(ResponseStream::typed(inner, self.codecs.clone(), qualifier))
    }

    /// Sends an envelope with the exchange shape of `mode`.
    ///
    /// Bypasses typed stubs while keeping routing, timeouts and error
    /// mapping. Stream elements come back decoded.
    pub async fn invoke(&self, message: ServiceMessage, mode: CommunicationMode) -> Result<Exchange> {
        match mode {
            CommunicationMode::FireAndForget | CommunicationMode::OneWay => {
                self.fire_and_forget(message).await?;
                Ok(Exchange::None)
            }
            CommunicationMode::RequestResponse => Ok(Exchange::Single(self.request_response(message).await?)),
            CommunicationMode::RequestStream => {
                let stream = self.request_stream(message).await?;
                Ok(Exchange::Stream(Box::pin(stream)))
            }
        }
    }

    async fn open_stream(&self, message: ServiceMessage) -> Result<meshrpc_common::transport::MessageStream> {
        let qualifier = message.qualifier().clone();
        let start = Instant::now();
        let result = self
            .with_deadline(async {
                let (address, channel, message) = self.connect(message).await?;
                let stream = channel.request_stream(message).await;
                self.check(&address, &channel, stream).await
            })
            .await;
        self.record(&qualifier, start, &result);
        result
    }

    /// Picks the target, encodes the message for it and gets a channel.
    async fn connect(
        &self,
        message: ServiceMessage,
    ) -> Result<(String, Arc<dyn ClientChannel>, ServiceMessage)> {
        let reference = self.select(message.qualifier())?;
        let address = reference.address();
        let message = self.encode_for(message, &reference)?;
        debug!(
            "Dispatching {} to {} at {}",
            message.qualifier(),
            reference.endpoint_id,
            address
        );
        let channel = self.pool.acquire(&address).await?;
        Ok((address, channel, message))
    }

    fn select(&self, qualifier: &Qualifier) -> Result<ServiceReference> {
        let reference = self.router.route(qualifier, &self.context).ok_or_else(|| {
            debug!("No endpoint for {}", qualifier);
            MeshError::ServiceNotFound(qualifier.to_string())
        })?;
        if let Some(metrics) = &self.metrics {
            metrics.record_route(&qualifier.to_string(), &reference.endpoint_id);
        }
        Ok(reference)
    }

    /// Stamps a content type the target understands, then encodes.
    fn encode_for(&self, message: ServiceMessage, reference: &ServiceReference) -> Result<ServiceMessage> {
        let message = match message.content_type() {
            Some(_) => message,
            None => {
                let content_type = self.content_type_for(reference);
                message.with_header(HEADER_CONTENT_TYPE, content_type)
            }
        };
        self.codecs.encode(message)
    }

    /// The endpoint's most preferred content type this caller has a codec
    /// for, else the caller's default.
    fn content_type_for(&self, reference: &ServiceReference) -> String {
        reference
            .content_types
            .iter()
            .find(|content_type| self.codecs.get(content_type.as_str()).is_some())
            .cloned()
            .unwrap_or_else(|| self.codecs.default_content_type().to_string())
    }

    /// Drops the pooled channel when the exchange failed at the transport level.
    async fn check<T>(&self, address: &str, channel: &Arc<dyn ClientChannel>, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if matches!(
                err,
                MeshError::Transport(_) | MeshError::Connection(_) | MeshError::Io(_)
            ) {
                warn!("Channel to {} failed: {}", address, err);
                self.pool.invalidate(address, channel).await;
            }
        }
        result
    }

    fn read_reply(&self, qualifier: &Qualifier, reply: ServiceMessage) -> Result<ServiceMessage> {
        let reply = self.codecs.decode(reply)?;
        match reply.error_data() {
            Some(error) => Err(MeshError::from_error_data(&qualifier.to_string(), error)),
            None => Ok(reply),
        }
    }

    async fn with_deadline<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(MeshError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    fn record<T>(&self, qualifier: &Qualifier, start: Instant, result: &Result<T>) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        let outcome = match result {
            Ok(_) => CallOutcome::Success,
            Err(err) if err.is_timeout() => CallOutcome::Timeout,
            Err(_) => CallOutcome::Failure,
        };
        metrics.record_call(&qualifier.to_string(), start, outcome);
    }
}

impl std::fmt::Debug for ServiceCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCall")
            .field("timeout", &self.timeout)
            .field("context", &self.context)
            .field("codecs", &self.codecs)
            .finish_non_exhaustive()
    }
}
