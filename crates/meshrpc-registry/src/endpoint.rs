use std::collections::BTreeMap;

use meshrpc_common::{CommunicationMode, MethodDescriptor, Qualifier, TypeTag};
use serde::{Deserialize, Serialize};

/// One method of one service, as exposed by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub qualifier: Qualifier,
    pub mode: CommunicationMode,
    pub request_type: TypeTag,
    pub response_type: TypeTag,
    /// Service level tags, e.g. `weight` for canary routing.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl ServiceRegistration {
    pub fn from_method(method: &MethodDescriptor, tags: &BTreeMap<String, String>) -> Self {
        Self {
            qualifier: method.qualifier().clone(),
            mode: method.mode(),
            request_type: method.request_type().clone(),
            response_type: method.response_type().clone(),
            tags: tags.clone(),
        }
    }
}

/// A cluster member hosting services.
///
/// Owned by the registry and replaced wholesale on every update, never
/// mutated in place once published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub id: String,
    pub host: String,
    pub port: u16,
    /// Accepted content types, preferred first.
    pub content_types: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub registrations: BTreeMap<Qualifier, ServiceRegistration>,
}

impl ServiceEndpoint {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            content_types: Vec::new(),
            tags: BTreeMap::new(),
            registrations: BTreeMap::new(),
        }
    }

    pub fn with_content_types<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = Vec::new();
        for content_type in content_types {
            let content_type = content_type.into();
            if !self.content_types.contains(&content_type) {
                self.content_types.push(content_type);
            }
        }
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Adds a registration, replacing any previous one for the same qualifier.
    pub fn with_registration(mut self, registration: ServiceRegistration) -> Self {
        self.upsert(registration);
        self
    }

    pub(crate) fn upsert(&mut self, registration: ServiceRegistration) {
        self.registrations
            .insert(registration.qualifier.clone(), registration);
    }

    /// `host:port`, the address channels are opened to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn has_services(&self) -> bool {
        !self.registrations.is_empty()
    }

    pub fn reference(&self, qualifier: &Qualifier) -> Option<ServiceReference> {
        self.registrations
            .get(qualifier)
            .map(|registration| ServiceReference::new(self, registration))
    }

    pub fn references(&self) -> impl Iterator<Item = ServiceReference> + '_ {
        self.registrations
            .values()
            .map(move |registration| ServiceReference::new(self, registration))
    }
}

/// A callable target: one registration on one endpoint.
///
/// Derived on demand from the endpoint and its registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceReference {
    pub qualifier: Qualifier,
    pub endpoint_id: String,
    pub host: String,
    pub port: u16,
    pub mode: CommunicationMode,
    pub request_type: TypeTag,
    pub response_type: TypeTag,
    /// Endpoint tags overlaid with the registration's own tags.
    pub tags: BTreeMap<String, String>,
    /// Content types of the endpoint, preferred first.
    pub content_types: Vec<String>,
}

impl ServiceReference {
    fn new(endpoint: &ServiceEndpoint, registration: &ServiceRegistration) -> Self {
        let mut tags = endpoint.tags.clone();
        tags.extend(
            registration
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        Self {
            qualifier: registration.qualifier.clone(),
            endpoint_id: endpoint.id.clone(),
            host: endpoint.host.clone(),
            port: endpoint.port,
            mode: registration.mode,
            request_type: registration.request_type.clone(),
            response_type: registration.response_type.clone(),
            tags,
            content_types: endpoint.content_types.clone(),
        }
    }

    pub fn service_name(&self) -> &str {
        self.qualifier.service()
    }

    pub fn method_name(&self) -> &str {
        self.qualifier.method()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Tag lookup ignoring ASCII case of the key.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrpc_common::ServiceDescriptor;

    fn greeting_registration(tags: &[(&str, &str)]) -> ServiceRegistration {
        let descriptor = ServiceDescriptor::builder("greeting")
            .request_response::<String, String>("hello")
            .build()
            .unwrap();
        let tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceRegistration::from_method(descriptor.method("hello").unwrap(), &tags)
    }

    #[test]
    fn test_content_types_keep_preference_order() {
        let endpoint = ServiceEndpoint::new("node-1", "10.0.0.1", 4801).with_content_types([
            "text/plain",
            "application/json",
            "text/plain",
        ]);
        assert_eq!(endpoint.content_types, vec!["text/plain", "application/json"]);
    }

    #[test]
    fn test_reference_carries_endpoint_and_method() {
        let endpoint = ServiceEndpoint::new("node-1", "10.0.0.1", 4801)
            .with_content_types(["application/json"])
            .with_registration(greeting_registration(&[]));

        let q = Qualifier::parse("greeting/hello").unwrap();
        let reference = endpoint.reference(&q).unwrap();
        assert_eq!(reference.endpoint_id, "node-1");
        assert_eq!(reference.address(), "10.0.0.1:4801");
        assert_eq!(reference.service_name(), "greeting");
        assert_eq!(reference.method_name(), "hello");
        assert_eq!(reference.mode, CommunicationMode::RequestResponse);
        assert_eq!(reference.request_type, TypeTag::of::<String>());
        assert_eq!(reference.content_types, vec!["application/json".to_string()]);

        assert!(endpoint
            .reference(&Qualifier::parse("greeting/other").unwrap())
            .is_none());
    }

    #[test]
    fn test_registration_tags_override_endpoint_tags() {
        let endpoint = ServiceEndpoint::new("node-1", "h", 1)
            .with_tag("zone", "eu")
            .with_tag("weight", "0.1")
            .with_registration(greeting_registration(&[("Weight", "0.7")]));

        let reference = endpoint.references().next().unwrap();
        assert_eq!(reference.tag("zone"), Some("eu"));
        assert_eq!(reference.tags.get("Weight").map(String::as_str), Some("0.7"));
        assert_eq!(reference.tag("WEIGHT"), Some("0.7"));
    }

    #[test]
    fn test_duplicate_registration_is_upsert() {
        let endpoint = ServiceEndpoint::new("node-1", "h", 1)
            .with_registration(greeting_registration(&[]))
            .with_registration(greeting_registration(&[("v", "2")]));
        assert_eq!(endpoint.registrations.len(), 1);
        assert_eq!(endpoint.references().next().unwrap().tag("v"), Some("2"));
    }
}
