use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use meshrpc_common::protocol::error::{MeshError, Result};
use meshrpc_common::transport::{CodecRegistry, MessageStream};
use meshrpc_common::{Qualifier, ServiceMessage};
use serde::de::DeserializeOwned;
use tracing::debug;

type Decoder<T> = fn(ServiceMessage) -> Result<T>;

/// Responses of a request-stream call, in the order the server emitted them.
///
/// Each element is decoded on arrival. The stream ends after the server
/// completes it or after the first error, which is yielded once. Dropping
/// the stream, or calling [`cancel`](Self::cancel), cancels the exchange so
/// the server stops producing.
pub struct ResponseStream<T> {
    inner: Option<MessageStream>,
    codecs: CodecRegistry,
    qualifier: Qualifier,
    decode: Decoder<T>,
}

impl<T: DeserializeOwned> ResponseStream<T> {
    pub(crate) fn typed(inner: MessageStream, codecs: CodecRegistry, qualifier: Qualifier) -> Self {
        Self {
            inner: Some(inner),
            codecs,
            qualifier,
            decode: |message| {
                message
                    .data_as::<T>()
                    .map_err(|e| MeshError::Codec(format!("cannot decode {}: {}", message.qualifier(), e)))
            },
        }
    }
}

impl ResponseStream<ServiceMessage> {
    pub(crate) fn raw(inner: MessageStream, codecs: CodecRegistry, qualifier: Qualifier) -> Self {
        Self {
            inner: Some(inner),
            codecs,
            qualifier,
            decode: Ok,
        }
    }
}

impl<T> ResponseStream<T> {
    pub fn qualifier(&self) -> &Qualifier {
        &self.qualifier
    }

    /// Stops consuming and cancels the exchange.
    pub fn cancel(&mut self) {
        if self.inner.take().is_some() {
            debug!("Cancelled response stream of {}", self.qualifier);
        }
    }

    /// Whether the stream has ended, been cancelled or failed.
    pub fn is_terminated(&self) -> bool {
        self.inner.is_none()
    }

    fn convert(&self, message: ServiceMessage) -> Result<T> {
        let message = self.codecs.decode(message)?;
        if let Some(error) = message.error_data() {
            return Err(MeshError::from_error_data(&self.qualifier.to_string(), error));
        }
        (self.decode)(message)
    }
}

impl<T> Stream for ResponseStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match inner.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            Poll::Ready(Some(item)) => {
                let converted = item.and_then(|message| this.convert(message));
                if converted.is_err() {
                    this.inner = None;
                }
                Poll::Ready(Some(converted))
            }
        }
    }
}

impl<T> fmt::Debug for ResponseStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("qualifier", &self.qualifier)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use meshrpc_common::ErrorData;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn numbers() -> Qualifier {
        Qualifier::parse("counter/numbers").unwrap()
    }

    fn item(n: i64) -> Result<ServiceMessage> {
        Ok(ServiceMessage::new(numbers()).with_value(json!(n)))
    }

    #[tokio::test]
    async fn test_typed_stream_in_order() {
        let inner: MessageStream = Box::pin(futures::stream::iter(vec![item(1), item(2), item(3)]));
        let stream = ResponseStream::<i64>::typed(inner, CodecRegistry::new(), numbers());
        let values: Vec<i64> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_error_message_ends_stream() {
        let error = ServiceMessage::error(numbers(), ErrorData::new(500, "boom"));
        let inner: MessageStream =
            Box::pin(futures::stream::iter(vec![item(1), Ok(error), item(3)]));
        let mut stream = ResponseStream::<i64>::typed(inner, CodecRegistry::new(), numbers());

        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        match stream.next().await {
            Some(Err(MeshError::Application { code, message })) => {
                assert_eq!(code, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("expected application error, got {:?}", other),
        }
        assert!(stream.next().await.is_none());
        assert!(stream.is_terminated());
    }

    #[tokio::test]
    async fn test_decode_failure_is_codec_error() {
        let bad = Ok(ServiceMessage::new(numbers()).with_value(json!("not a number")));
        let inner: MessageStream = Box::pin(futures::stream::iter(vec![bad]));
        let mut stream = ResponseStream::<i64>::typed(inner, CodecRegistry::new(), numbers());
        assert!(matches!(stream.next().await, Some(Err(MeshError::Codec(_)))));
    }

    #[tokio::test]
    async fn test_raw_stream_decodes_payload() {
        let codecs = CodecRegistry::new();
        let encoded = codecs
            .encode(ServiceMessage::new(numbers()).with_value(json!({"n": 7})))
            .unwrap();
        let inner: MessageStream = Box::pin(futures::stream::iter(vec![Ok(encoded)]));
        let mut stream = ResponseStream::raw(inner, codecs, numbers());

        let message = stream.next().await.unwrap().unwrap();
        assert_eq!(message.data_as::<serde_json::Value>().unwrap(), json!({"n": 7}));
    }

    #[tokio::test]
    async fn test_cancel_drops_inner_stream() {
        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Flag(dropped.clone());
        let inner: MessageStream = Box::pin(futures::stream::pending::<Result<ServiceMessage>>().map(
            move |item| {
                let _keep = &flag;
                item
            },
        ));
        let mut stream = ResponseStream::<i64>::typed(inner, CodecRegistry::new(), numbers());

        stream.cancel();
        assert!(dropped.load(Ordering::SeqCst));
        assert!(stream.next().await.is_none());
    }
}
