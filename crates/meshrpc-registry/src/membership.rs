//! Cluster membership events and the endpoint metadata format.
//!
//! The gossip layer itself lives elsewhere; the registry only consumes its
//! events. Each member announces its services through a flat metadata map
//! using the reserved `meshrpc.` key namespace:
//!
//! | key | value |
//! |---|---|
//! | `meshrpc.content-types` | comma separated content types |
//! | `meshrpc.tag.<key>` | endpoint tag |
//! | `meshrpc.service.<qualifier>` | JSON [`ServiceRegistration`] |
//!
//! Keys outside the namespace belong to other subsystems and are ignored.

use std::collections::HashMap;

use meshrpc_common::Qualifier;
use tracing::warn;

use crate::endpoint::{ServiceEndpoint, ServiceRegistration};

pub const METADATA_PREFIX: &str = "meshrpc.";
pub const CONTENT_TYPES_KEY: &str = "meshrpc.content-types";
pub const TAG_PREFIX: &str = "meshrpc.tag.";
pub const SERVICE_PREFIX: &str = "meshrpc.service.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEventKind {
    Added,
    Removed,
    Updated,
}

/// Identity of a cluster member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl Member {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    pub kind: MembershipEventKind,
    pub member: Member,
    pub metadata: HashMap<String, String>,
}

impl MembershipEvent {
    pub fn added(member: Member, metadata: HashMap<String, String>) -> Self {
        Self {
            kind: MembershipEventKind::Added,
            member,
            metadata,
        }
    }

    pub fn updated(member: Member, metadata: HashMap<String, String>) -> Self {
        Self {
            kind: MembershipEventKind::Updated,
            member,
            metadata,
        }
    }

    pub fn removed(member: Member) -> Self {
        Self {
            kind: MembershipEventKind::Removed,
            member,
            metadata: HashMap::new(),
        }
    }
}

/// Builds the endpoint a member announces.
///
/// Malformed service entries are skipped with a warning. Returns `None` when
/// no service registration survives.
pub fn parse_endpoint(member: &Member, metadata: &HashMap<String, String>) -> Option<ServiceEndpoint> {
    let mut endpoint = ServiceEndpoint::new(member.id.clone(), member.host.clone(), member.port);

    for (key, value) in metadata {
        if key == CONTENT_TYPES_KEY {
            endpoint = endpoint.with_content_types(value.split(',').map(str::trim).filter(|s| !s.is_empty()));
        } else if let Some(tag) = key.strip_prefix(TAG_PREFIX) {
            endpoint.tags.insert(tag.to_string(), value.clone());
        } else if let Some(raw_qualifier) = key.strip_prefix(SERVICE_PREFIX) {
            match parse_registration(raw_qualifier, value) {
                Ok(registration) => endpoint.upsert(registration),
                Err(reason) => warn!(
                    "Ignoring service entry '{}' of member {}: {}",
                    key, member.id, reason
                ),
            }
        }
    }

    endpoint.has_services().then_some(endpoint)
}

fn parse_registration(raw_qualifier: &str, value: &str) -> Result<ServiceRegistration, String> {
    let qualifier = Qualifier::parse(raw_qualifier).map_err(|e| e.to_string())?;
    let registration: ServiceRegistration =
        serde_json::from_str(value).map_err(|e| format!("invalid registration: {}", e))?;
    if registration.qualifier != qualifier {
        return Err(format!(
            "registration is for {}, key says {}",
            registration.qualifier, qualifier
        ));
    }
    Ok(registration)
}

/// Renders an endpoint into announcement metadata. Inverse of [`parse_endpoint`].
pub fn encode_endpoint(endpoint: &ServiceEndpoint) -> HashMap<String, String> {
    let mut metadata = HashMap::new();

    if !endpoint.content_types.is_empty() {
        let content_types: Vec<&str> = endpoint.content_types.iter().map(String::as_str).collect();
        metadata.insert(CONTENT_TYPES_KEY.to_string(), content_types.join(","));
    }
    for (key, value) in &endpoint.tags {
        metadata.insert(format!("{}{}", TAG_PREFIX, key), value.clone());
    }
    for (qualifier, registration) in &endpoint.registrations {
        match serde_json::to_string(registration) {
            Ok(json) => {
                metadata.insert(format!("{}{}", SERVICE_PREFIX, qualifier), json);
            }
            Err(e) => warn!("Cannot announce {}: {}", qualifier, e),
        }
    }

    metadata
}
