use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::MeshError;

/// The call shape of a service method.
///
/// Fixed when the method is registered and never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommunicationMode {
    /// No payload, no response.
    FireAndForget,
    /// Payload, no response.
    OneWay,
    /// Payload, exactly one response.
    RequestResponse,
    /// Payload, a finite lazy sequence of responses.
    RequestStream,
}

impl CommunicationMode {
    /// Whether the caller waits for anything coming back.
    pub fn expects_response(self) -> bool {
        matches!(
            self,
            CommunicationMode::RequestResponse | CommunicationMode::RequestStream
        )
    }

    pub fn is_stream(self) -> bool {
        self == CommunicationMode::RequestStream
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommunicationMode::FireAndForget => "FIRE_AND_FORGET",
            CommunicationMode::OneWay => "ONE_WAY",
            CommunicationMode::RequestResponse => "REQUEST_RESPONSE",
            CommunicationMode::RequestStream => "REQUEST_STREAM",
        }
    }
}

impl fmt::Display for CommunicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommunicationMode {
    type Err = MeshError;

    /// Accepts the wire names as well as their kebab-case spelling,
    /// ignoring case: `REQUEST_RESPONSE`, `request-response`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().replace('-', "_").as_str() {
            "FIRE_AND_FORGET" => Ok(CommunicationMode::FireAndForget),
            "ONE_WAY" => Ok(CommunicationMode::OneWay),
            "REQUEST_RESPONSE" => Ok(CommunicationMode::RequestResponse),
            "REQUEST_STREAM" => Ok(CommunicationMode::RequestStream),
            _ => Err(MeshError::Definition(format!("unknown communication mode '{}'", value))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_bearing_modes() {
        assert!(!CommunicationMode::FireAndForget.expects_response());
        assert!(!CommunicationMode::OneWay.expects_response());
        assert!(CommunicationMode::RequestResponse.expects_response());
        assert!(CommunicationMode::RequestStream.expects_response());
    }

    #[test]
    fn test_serde_names_match_display() {
        let json = serde_json::to_string(&CommunicationMode::RequestStream).unwrap();
        assert_eq!(json, "\"REQUEST_STREAM\"");
        assert_eq!(CommunicationMode::OneWay.to_string(), "ONE_WAY");
    }

    #[test]
    fn test_parse_both_spellings() {
        assert_eq!("request-stream".parse::<CommunicationMode>().unwrap(), CommunicationMode::RequestStream);
        assert_eq!("ONE_WAY".parse::<CommunicationMode>().unwrap(), CommunicationMode::OneWay);
        assert_eq!("Fire-And-Forget".parse::<CommunicationMode>().unwrap(), CommunicationMode::FireAndForget);
        assert!("sometimes".parse::<CommunicationMode>().is_err());
    }
}
