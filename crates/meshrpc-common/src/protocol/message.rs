use super::error::{ErrorData, MeshError, Result};
use super::qualifier::Qualifier;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

/// Header selecting the codec for the payload.
pub const HEADER_CONTENT_TYPE: &str = "content-type";
/// Header marking an error response; its value is the error code.
pub const HEADER_ERROR_CODE: &str = "error-code";
/// Content type used when neither side says otherwise.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Message payload.
///
/// Either decoded or encoded, never both. Codecs move a payload between
/// the two states.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Value(Value),
    Encoded(Vec<u8>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Empty => true,
            Payload::Encoded(bytes) => bytes.is_empty(),
            Payload::Value(_) => false,
        }
    }

    pub fn is_encoded(&self) -> bool {
        matches!(self, Payload::Encoded(_))
    }
}

/// The envelope exchanged between caller and callee.
///
/// Built once and then only transformed into new messages; there are no
/// setters that mutate a message in place after it has been shared.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceMessage {
    qualifier: Qualifier,
    data: Payload,
    headers: HashMap<String, String>,
}

impl ServiceMessage {
    /// Creates a message with an empty payload and no headers.
    pub fn new(qualifier: Qualifier) -> Self {
        Self {
            qualifier,
            data: Payload::Empty,
            headers: HashMap::new(),
        }
    }

    /// Sets the payload from any serializable value.
    pub fn with_data<T: Serialize + ?Sized>(self, data: &T) -> Result<Self> {
        Ok(self.with_value(serde_json::to_value(data)?))
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.data = Payload::Value(value);
        self
    }

    pub fn with_payload(mut self, data: Payload) -> Self {
        self.data = data;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Same payload and headers, addressed to another qualifier.
    pub fn with_qualifier(mut self, qualifier: Qualifier) -> Self {
        self.qualifier = qualifier;
        self
    }

    pub fn qualifier(&self) -> &Qualifier {
        &self.qualifier
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(HEADER_CONTENT_TYPE)
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn into_parts(self) -> (Qualifier, Payload, HashMap<String, String>) {
        (self.qualifier, self.data, self.headers)
    }

    /// Deserializes a decoded payload into `T`.
    ///
    /// An empty payload is read as JSON `null`, so `()` and `Option<_>`
    /// accept it. Encoded payloads must go through a codec first.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.data {
            Payload::Empty => Ok(serde_json::from_value(Value::Null)?),
            Payload::Value(value) => Ok(serde_json::from_value(value.clone())?),
            Payload::Encoded(_) => Err(MeshError::Codec(format!(
                "payload of {} is still encoded",
                self.qualifier
            ))),
        }
    }

    /// Builds an error response for `qualifier`.
    pub fn error(qualifier: Qualifier, error: ErrorData) -> Self {
        Self::new(qualifier)
            .with_header(HEADER_ERROR_CODE, error.code.to_string())
            .with_value(json!({ "code": error.code, "message": error.message }))
    }

    pub fn is_error(&self) -> bool {
        self.headers.contains_key(HEADER_ERROR_CODE)
    }

    /// Extracts the error carried by an error response.
    ///
    /// Returns `None` for regular messages. A malformed error payload still
    /// yields an error, built from the header code.
    pub fn error_data(&self) -> Option<ErrorData> {
        let code = self.header(HEADER_ERROR_CODE)?;
        if let Payload::Value(value) = &self.data {
            if let Ok(data) = serde_json::from_value::<ErrorData>(value.clone()) {
                return Some(data);
            }
        }
        let code = code.parse().unwrap_or(super::error::codes::APPLICATION);
        Some(ErrorData::new(code, format!("{} failed", self.qualifier)))
    }
}
