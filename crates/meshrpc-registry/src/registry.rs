use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use meshrpc_common::{MeshError, Qualifier, Result, ServiceDescriptor};
use tracing::{debug, info};

use crate::endpoint::{ServiceEndpoint, ServiceReference, ServiceRegistration};
use crate::membership::{self, MembershipEvent, MembershipEventKind};

/// Process-wide table of known endpoints, local and remote.
///
/// Endpoints are stored as `Arc<ServiceEndpoint>` and replaced wholesale on
/// every change, so a reader holding an endpoint always sees one complete
/// registration set. The table is eventually consistent with membership:
/// remote entries mirror the last event received for each member.
///
/// # Example
///
/// ```rust
/// use meshrpc_common::{Qualifier, ServiceDescriptor};
/// use meshrpc_registry::{ServiceEndpoint, ServiceRegistry};
/// use std::collections::BTreeMap;
///
/// let registry = ServiceRegistry::new(ServiceEndpoint::new("local", "127.0.0.1", 4801));
/// let greeting = ServiceDescriptor::builder("greeting")
///     .request_response::<String, String>("hello")
///     .build()
///     .unwrap();
/// registry.register_local(&greeting, &BTreeMap::new()).unwrap();
///
/// let q = Qualifier::parse("greeting/hello").unwrap();
/// assert_eq!(registry.references_for(&q).len(), 1);
/// ```
#[derive(Debug)]
pub struct ServiceRegistry {
    local_id: String,
    endpoints: DashMap<String, Arc<ServiceEndpoint>>,
}

impl ServiceRegistry {
    /// Creates a registry owning `local` as this node's endpoint.
    pub fn new(local: ServiceEndpoint) -> Self {
        let endpoints = DashMap::new();
        let local_id = local.id.clone();
        endpoints.insert(local_id.clone(), Arc::new(local));
        Self { local_id, endpoints }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Registers every method of a locally hosted service.
    ///
    /// Registering the same service again replaces its registrations, so the
    /// local qualifier set never contains duplicates.
    pub fn register_local(
        &self,
        descriptor: &ServiceDescriptor,
        tags: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut slot = self.endpoints.get_mut(&self.local_id).ok_or_else(|| {
            MeshError::Definition(format!("local endpoint {} is missing", self.local_id))
        })?;

        let mut updated = ServiceEndpoint::clone(&slot);
        for method in descriptor.methods() {
            updated.upsert(ServiceRegistration::from_method(method, tags));
        }
        *slot = Arc::new(updated);

        info!(
            "Registered local service {} ({} methods)",
            descriptor.name(),
            descriptor.methods().count()
        );
        Ok(())
    }

    /// Applies one membership event.
    ///
    /// ADDED and UPDATED replace the member's endpoint with the one parsed
    /// from its metadata, or drop it when the metadata announces no services.
    /// REMOVED drops it. Events about the local member are ignored.
    pub fn on_membership_event(&self, event: &MembershipEvent) {
        let id = &event.member.id;
        if *id == self.local_id {
            debug!("Ignoring membership event for the local member");
            return;
        }

        match event.kind {
            MembershipEventKind::Added | MembershipEventKind::Updated => {
                match membership::parse_endpoint(&event.member, &event.metadata) {
                    Some(endpoint) => {
                        info!(
                            "Endpoint {} at {} now exposes {} methods",
                            id,
                            endpoint.address(),
                            endpoint.registrations.len()
                        );
                        self.endpoints.insert(id.clone(), Arc::new(endpoint));
                    }
                    None => {
                        if self.endpoints.remove(id).is_some() {
                            info!("Endpoint {} no longer exposes services", id);
                        }
                    }
                }
            }
            MembershipEventKind::Removed => {
                if self.endpoints.remove(id).is_some() {
                    info!("Endpoint {} removed", id);
                }
            }
        }
    }

    /// Snapshot of all references, optionally for one service only.
    ///
    /// Ordered by qualifier, then endpoint id.
    pub fn list_service_references(&self, service_name: Option<&str>) -> Vec<ServiceReference> {
        let mut references: Vec<ServiceReference> = self
            .snapshot()
            .iter()
            .flat_map(|endpoint| endpoint.references().collect::<Vec<_>>())
            .filter(|reference| service_name.map_or(true, |name| reference.service_name() == name))
            .collect();
        references.sort_by(|a, b| {
            a.qualifier
                .cmp(&b.qualifier)
                .then_with(|| a.endpoint_id.cmp(&b.endpoint_id))
        });
        references
    }

    /// Candidates for one qualifier, ordered by endpoint id.
    pub fn references_for(&self, qualifier: &Qualifier) -> Vec<ServiceReference> {
        let mut references: Vec<ServiceReference> = self
            .endpoints
            .iter()
            .filter_map(|entry| entry.value().reference(qualifier))
            .collect();
        references.sort_by(|a, b| a.endpoint_id.cmp(&b.endpoint_id));
        references
    }

    /// First endpoint (by id) exposing `qualifier`.
    pub fn endpoint_for_qualifier(&self, qualifier: &Qualifier) -> Option<Arc<ServiceEndpoint>> {
        self.snapshot()
            .into_iter()
            .find(|endpoint| endpoint.registrations.contains_key(qualifier))
    }

    /// All endpoints, ordered by id.
    pub fn endpoints(&self) -> Vec<Arc<ServiceEndpoint>> {
        self.snapshot()
    }

    pub fn endpoint(&self, id: &str) -> Option<Arc<ServiceEndpoint>> {
        self.endpoints.get(id).map(|entry| entry.value().clone())
    }

    pub fn local_endpoint(&self) -> Option<Arc<ServiceEndpoint>> {
        self.endpoint(&self.local_id)
    }

    /// Announcement metadata for the local endpoint.
    pub fn local_metadata(&self) -> HashMap<String, String> {
        self.local_endpoint()
            .map(|endpoint| membership::encode_endpoint(&endpoint))
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Vec<Arc<ServiceEndpoint>> {
        let mut endpoints: Vec<Arc<ServiceEndpoint>> = self
            .endpoints
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::Member;

    fn greeting() -> ServiceDescriptor {
        ServiceDescriptor::builder("greeting")
            .request_response::<String, String>("hello")
            .request_stream::<u32, String>("many")
            .build()
            .unwrap()
    }

    fn echo() -> ServiceDescriptor {
        ServiceDescriptor::builder("echo")
            .request_response::<String, String>("echo")
            .build()
            .unwrap()
    }

    fn remote_metadata(services: &[ServiceDescriptor]) -> HashMap<String, String> {
        let endpoint = services.iter().flat_map(|s| s.methods()).fold(
            ServiceEndpoint::new("ignored", "ignored", 0),
            |ep, m| ep.with_registration(ServiceRegistration::from_method(m, &BTreeMap::new())),
        );
        membership::encode_endpoint(&endpoint)
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new(ServiceEndpoint::new("local", "127.0.0.1", 4800))
    }

    fn q(s: &str) -> Qualifier {
        Qualifier::parse(s).unwrap()
    }

    fn endpoint_ids(registry: &ServiceRegistry, qualifier: &str) -> Vec<String> {
        registry
            .references_for(&q(qualifier))
            .into_iter()
            .map(|r| r.endpoint_id)
            .collect()
    }

    #[test]
    fn test_register_local_is_idempotent() {
        let registry = registry();
        registry.register_local(&greeting(), &BTreeMap::new()).unwrap();
        let before = registry.local_endpoint().unwrap();
        registry.register_local(&greeting(), &BTreeMap::new()).unwrap();
        let after = registry.local_endpoint().unwrap();

        assert_eq!(before.registrations, after.registrations);
        assert_eq!(registry.list_service_references(None).len(), 2);
    }

    #[test]
    fn test_register_local_keeps_other_services() {
        let registry = registry();
        registry.register_local(&greeting(), &BTreeMap::new()).unwrap();
        registry.register_local(&echo(), &BTreeMap::new()).unwrap();
        assert_eq!(registry.list_service_references(None).len(), 3);
        assert_eq!(registry.list_service_references(Some("echo")).len(), 1);
        assert_eq!(registry.list_service_references(Some("missing")).len(), 0);
    }

    #[test]
    fn test_added_updated_removed() {
        let registry = registry();
        let member = Member::new("node-a", "10.0.0.1", 4801);

        registry.on_membership_event(&MembershipEvent::added(
            member.clone(),
            remote_metadata(&[greeting()]),
        ));
        assert_eq!(endpoint_ids(&registry, "greeting/hello"), vec!["node-a"]);
        assert_eq!(registry.list_service_references(None).len(), 2);

        // UPDATED replaces the whole set: greeting is gone, echo is new.
        registry.on_membership_event(&MembershipEvent::updated(
            member.clone(),
            remote_metadata(&[echo()]),
        ));
        assert!(endpoint_ids(&registry, "greeting/hello").is_empty());
        assert_eq!(endpoint_ids(&registry, "echo/echo"), vec!["node-a"]);
        assert_eq!(registry.list_service_references(None).len(), 1);

        registry.on_membership_event(&MembershipEvent::removed(member));
        assert!(registry.list_service_references(None).is_empty());
        assert!(registry.endpoint("node-a").is_none());
    }

    #[test]
    fn test_removed_unknown_member_is_noop() {
        let registry = registry();
        registry.on_membership_event(&MembershipEvent::removed(Member::new("ghost", "h", 1)));
        assert_eq!(registry.endpoints().len(), 1);
    }

    #[test]
    fn test_update_without_services_removes_endpoint() {
        let registry = registry();
        let member = Member::new("node-a", "10.0.0.1", 4801);
        registry.on_membership_event(&MembershipEvent::added(
            member.clone(),
            remote_metadata(&[greeting()]),
        ));
        registry.on_membership_event(&MembershipEvent::updated(member, HashMap::new()));
        assert!(registry.endpoint("node-a").is_none());
    }

    #[test]
    fn test_events_for_local_member_are_ignored() {
        let registry = registry();
        registry.register_local(&greeting(), &BTreeMap::new()).unwrap();
        registry.on_membership_event(&MembershipEvent::removed(Member::new("local", "h", 1)));
        assert_eq!(endpoint_ids(&registry, "greeting/hello"), vec!["local"]);
    }

    #[test]
    fn test_references_sorted_by_endpoint_id() {
        let registry = registry();
        for id in ["node-c", "node-a", "node-b"] {
            registry.on_membership_event(&MembershipEvent::added(
                Member::new(id, "h", 1),
                remote_metadata(&[greeting()]),
            ));
        }
        assert_eq!(
            endpoint_ids(&registry, "greeting/hello"),
            vec!["node-a", "node-b", "node-c"]
        );
        assert_eq!(
            registry
                .endpoint_for_qualifier(&q("greeting/hello"))
                .unwrap()
                .id,
            "node-a"
        );
        assert!(registry.endpoint_for_qualifier(&q("nope/nope")).is_none());
    }

    #[test]
    fn test_event_sequence_reflects_exactly_the_last_state() {
        let registry = registry();
        let a = Member::new("a", "h", 1);
        let b = Member::new("b", "h", 2);

        let events = vec![
            MembershipEvent::added(a.clone(), remote_metadata(&[greeting()])),
            MembershipEvent::added(b.clone(), remote_metadata(&[greeting(), echo()])),
            MembershipEvent::updated(a.clone(), remote_metadata(&[greeting()])),
            MembershipEvent::removed(b.clone()),
            MembershipEvent::added(b.clone(), remote_metadata(&[echo()])),
            MembershipEvent::updated(a.clone(), remote_metadata(&[greeting()])),
        ];
        for event in &events {
            registry.on_membership_event(event);
        }

        let listed: Vec<(String, String)> = registry
            .list_service_references(None)
            .into_iter()
            .map(|r| (r.qualifier.to_string(), r.endpoint_id))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("echo/echo".to_string(), "b".to_string()),
                ("greeting/hello".to_string(), "a".to_string()),
                ("greeting/many".to_string(), "a".to_string()),
            ]
        );
    }

    #[test]
    fn test_local_metadata_announces_local_services() {
        let registry = registry();
        registry
            .register_local(
                &greeting(),
                &BTreeMap::from([("weight".to_string(), "0.7".to_string())]),
            )
            .unwrap();

        let metadata = registry.local_metadata();
        let parsed =
            membership::parse_endpoint(&Member::new("local", "127.0.0.1", 4800), &metadata).unwrap();
        assert_eq!(parsed.registrations.len(), 2);
        assert!(parsed
            .registrations
            .values()
            .all(|r| r.tags.get("weight").map(String::as_str) == Some("0.7")));
    }

    #[test]
    fn test_readers_never_see_partial_updates() {
        use std::thread;

        let registry = Arc::new(registry());
        let member = Member::new("node-a", "h", 1);
        let both = remote_metadata(&[greeting(), echo()]);
        let one = remote_metadata(&[echo()]);
        registry.on_membership_event(&MembershipEvent::added(member.clone(), both.clone()));

        let writer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let metadata = if i % 2 == 0 { one.clone() } else { both.clone() };
                    registry.on_membership_event(&MembershipEvent::updated(member.clone(), metadata));
                }
            })
        };

        for _ in 0..500 {
            if let Some(endpoint) = registry.endpoint("node-a") {
                let count = endpoint.registrations.len();
                assert!(count == 1 || count == 3, "torn update: {} registrations", count);
            }
        }
        writer.join().unwrap();
    }
}
