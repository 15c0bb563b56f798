use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::protocol::error::{MeshError, Result};
use crate::protocol::{Payload, ServiceMessage, DEFAULT_CONTENT_TYPE, HEADER_CONTENT_TYPE};

/// Encodes and decodes message payloads for one content type.
pub trait MessageCodec: Send + Sync {
    /// The content type this codec handles, e.g. `application/json`.
    fn content_type(&self) -> &str;

    /// Encode a decoded payload to bytes
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes into a payload value
    fn decode_value(&self, data: &[u8]) -> Result<Value>;
}

/// JSON payload codec.
///
/// # Example
///
/// ```
/// use meshrpc_common::transport::{JsonCodec, MessageCodec};
/// use serde_json::json;
///
/// let codec = JsonCodec;
/// let bytes = codec.encode_value(&json!({"n": 42})).unwrap();
/// assert_eq!(codec.decode_value(&bytes).unwrap(), json!({"n": 42}));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn content_type(&self) -> &str {
        DEFAULT_CONTENT_TYPE
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode_value(&self, data: &[u8]) -> Result<Value> {
        serde_json::from_slice(data).map_err(|e| MeshError::Codec(format!("invalid JSON payload: {}", e)))
    }
}

/// Codecs keyed by content type.
///
/// Always contains [`JsonCodec`], which is also the default used for
/// messages without a `content-type` header.
#[derive(Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn MessageCodec>>,
    default_content_type: String,
}

impl CodecRegistry {
    pub fn new() -> Self {
        let mut codecs: HashMap<String, Arc<dyn MessageCodec>> = HashMap::new();
        codecs.insert(DEFAULT_CONTENT_TYPE.to_string(), Arc::new(JsonCodec));
        Self {
            codecs,
            default_content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    /// Adds a codec, replacing any codec for the same content type.
    pub fn register(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codecs.insert(codec.content_type().to_string(), codec);
        self
    }

    /// Changes the content type used for messages that carry none.
    pub fn with_default(mut self, content_type: impl Into<String>) -> Result<Self> {
        let content_type = content_type.into();
        if !self.codecs.contains_key(&content_type) {
            return Err(MeshError::Codec(format!("no codec for content type '{}'", content_type)));
        }
        self.default_content_type = content_type;
        Ok(self)
    }

    pub fn get(&self, content_type: &str) -> Option<Arc<dyn MessageCodec>> {
        self.codecs.get(content_type).cloned()
    }

    pub fn default_content_type(&self) -> &str {
        &self.default_content_type
    }

    /// Supported content types, sorted.
    pub fn content_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.codecs.keys().cloned().collect();
        types.sort();
        types
    }

    fn codec_for(&self, message: &ServiceMessage) -> Result<(String, Arc<dyn MessageCodec>)> {
        let content_type = message
            .content_type()
            .unwrap_or(&self.default_content_type)
            .to_string();
        let codec = self
            .get(&content_type)
            .ok_or_else(|| MeshError::Codec(format!("no codec for content type '{}'", content_type)))?;
        Ok((content_type, codec))
    }

    /// Turns a decoded payload into bytes and stamps the content type.
    ///
    /// Empty and already encoded payloads pass through unchanged.
    pub fn encode(&self, message: ServiceMessage) -> Result<ServiceMessage> {
        let (content_type, codec) = self.codec_for(&message)?;
        let bytes = match message.data() {
            Payload::Value(value) => codec.encode_value(value)?,
            Payload::Empty | Payload::Encoded(_) => return Ok(message),
        };
        Ok(message
            .with_payload(Payload::Encoded(bytes))
            .with_header(HEADER_CONTENT_TYPE, content_type))
    }

    /// Turns an encoded payload back into a value.
    ///
    /// Zero bytes decode to an empty payload.
    pub fn decode(&self, message: ServiceMessage) -> Result<ServiceMessage> {
        let (_, codec) = self.codec_for(&message)?;
        let payload = match message.data() {
            Payload::Encoded(bytes) if bytes.is_empty() => Payload::Empty,
            Payload::Encoded(bytes) => Payload::Value(codec.decode_value(bytes)?),
            Payload::Empty | Payload::Value(_) => return Ok(message),
        };
        Ok(message.with_payload(payload))
    }

    /// Decodes the message and reads its payload as `T`.
    pub fn decode_as<T: DeserializeOwned>(&self, message: ServiceMessage) -> Result<T> {
        let decoded = self.decode(message)?;
        decoded
            .data_as()
            .map_err(|e| MeshError::Codec(format!("cannot decode {}: {}", decoded.qualifier(), e)))
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("content_types", &self.content_types())
            .field("default_content_type", &self.default_content_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Qualifier;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        items: Vec<String>,
    }

    fn msg() -> ServiceMessage {
        ServiceMessage::new(Qualifier::parse("orders/place").unwrap())
    }

    #[test]
    fn test_encode_then_decode_yields_original_object() {
        let codecs = CodecRegistry::new();
        let order = Order {
            id: 7,
            items: vec!["tea".into(), "cake".into()],
        };

        let encoded = codecs.encode(msg().with_data(&order).unwrap()).unwrap();
        assert!(encoded.data().is_encoded());
        assert_eq!(encoded.content_type(), Some("application/json"));

        let back: Order = codecs.decode_as(encoded).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn test_empty_payload_passes_through() {
        let codecs = CodecRegistry::new();
        let encoded = codecs.encode(msg()).unwrap();
        assert_eq!(encoded.data(), &Payload::Empty);

        let decoded = codecs
            .decode(msg().with_payload(Payload::Encoded(Vec::new())))
            .unwrap();
        assert_eq!(decoded.data(), &Payload::Empty);
    }

    #[test]
    fn test_unknown_content_type_is_codec_error() {
        let codecs = CodecRegistry::new();
        let m = msg()
            .with_header(HEADER_CONTENT_TYPE, "application/x-unknown")
            .with_value(json!(1));
        assert!(matches!(codecs.encode(m), Err(MeshError::Codec(_))));
    }

    #[test]
    fn test_malformed_bytes_are_codec_error() {
        let codecs = CodecRegistry::new();
        let m = msg().with_payload(Payload::Encoded(b"{not json".to_vec()));
        assert!(matches!(codecs.decode(m), Err(MeshError::Codec(_))));
    }

    #[test]
    fn test_wrong_target_type_is_codec_error() {
        let codecs = CodecRegistry::new();
        let encoded = codecs.encode(msg().with_value(json!("text"))).unwrap();
        assert!(matches!(codecs.decode_as::<Order>(encoded), Err(MeshError::Codec(_))));
    }

    struct ShoutCodec;

    impl MessageCodec for ShoutCodec {
        fn content_type(&self) -> &str {
            "text/shout"
        }

        fn encode_value(&self, value: &Value) -> Result<Vec<u8>> {
            Ok(value.as_str().unwrap_or_default().to_uppercase().into_bytes())
        }

        fn decode_value(&self, data: &[u8]) -> Result<Value> {
            Ok(Value::String(String::from_utf8_lossy(data).to_lowercase()))
        }
    }

    #[test]
    fn test_content_type_header_selects_codec() {
        let codecs = CodecRegistry::new().register(Arc::new(ShoutCodec));
        assert_eq!(codecs.content_types(), vec!["application/json", "text/shout"]);

        let m = msg()
            .with_header(HEADER_CONTENT_TYPE, "text/shout")
            .with_value(json!("hello"));
        let encoded = codecs.encode(m).unwrap();
        assert_eq!(encoded.data(), &Payload::Encoded(b"HELLO".to_vec()));

        let decoded = codecs.decode(encoded).unwrap();
        assert_eq!(decoded.data(), &Payload::Value(json!("hello")));
    }

    #[test]
    fn test_default_content_type_must_be_registered() {
        assert!(CodecRegistry::new().with_default("text/shout").is_err());
        let codecs = CodecRegistry::new()
            .register(Arc::new(ShoutCodec))
            .with_default("text/shout")
            .unwrap();
        assert_eq!(codecs.default_content_type(), "text/shout");
    }
}
