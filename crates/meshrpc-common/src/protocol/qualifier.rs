//! Qualifier: the wire identifier of one remote-callable operation.
//!
//! The textual form is `"<serviceName>/<methodName>"` with exactly one
//! separator. It is the only bit-exact contract between versions.

use super::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between the service name and the method name.
pub const SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Qualifier {
    service: String,
    method: String,
}

impl Qualifier {
    /// Builds a qualifier from its two parts.
    ///
    /// Both parts must be non-empty and must not contain the separator.
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Result<Self> {
        let service = service.into();
        let method = method.into();

        for (what, part) in [("service name", &service), ("method name", &method)] {
            if part.is_empty() {
                return Err(MeshError::InvalidQualifier(format!(
                    "{} must not be empty",
                    what
                )));
            }
            if part.contains(SEPARATOR) {
                return Err(MeshError::InvalidQualifier(format!(
                    "{} '{}' must not contain '{}'",
                    what, part, SEPARATOR
                )));
            }
        }

        Ok(Self { service, method })
    }

    /// Parses the wire form `"service/method"`.
    pub fn parse(value: &str) -> Result<Self> {
        match value.split_once(SEPARATOR) {
            Some((service, method)) => Self::new(service, method),
            None => Err(MeshError::InvalidQualifier(format!(
                "'{}' is not of the form service{}method",
                value, SEPARATOR
            ))),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.service, SEPARATOR, self.method)
    }
}

impl FromStr for Qualifier {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Qualifier {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Qualifier> for String {
    fn from(value: Qualifier) -> Self {
        value.to_string()
    }
}
