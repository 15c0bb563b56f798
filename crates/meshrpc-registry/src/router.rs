use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use meshrpc_common::Qualifier;
use rand::Rng;

use crate::endpoint::ServiceReference;
use crate::registry::ServiceRegistry;

/// Caller supplied routing hints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingContext {
    /// Tags a candidate must carry with exactly these values.
    pub required_tags: BTreeMap<String, String>,
    /// Calls with the same key stick to the same endpoint.
    pub affinity_key: Option<String>,
}

impl RoutingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required_tags.insert(key.into(), value.into());
        self
    }

    pub fn with_affinity(mut self, key: impl Into<String>) -> Self {
        self.affinity_key = Some(key.into());
        self
    }

    /// Whether `reference` satisfies every required tag.
    pub fn matches(&self, reference: &ServiceReference) -> bool {
        self.required_tags
            .iter()
            .all(|(key, value)| reference.tag(key) == Some(value.as_str()))
    }
}

/// Picks one target for a call.
///
/// Candidates are read from the registry on every call; a router never
/// caches them.
pub trait Router: Send + Sync {
    fn route(&self, qualifier: &Qualifier, context: &RoutingContext) -> Option<ServiceReference>;
}

/// Round-robin over the current candidates of each qualifier.
///
/// A per-qualifier counter advances atomically on every call; concurrent
/// calls may share an index, but the counter never goes backwards.
pub struct RoundRobinRouter {
    registry: Arc<ServiceRegistry>,
    counters: DashMap<Qualifier, AtomicUsize>,
}

impl RoundRobinRouter {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            counters: DashMap::new(),
        }
    }

    pub(crate) fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Next candidate in cyclic order, `None` for an empty set.
    pub(crate) fn select(
        &self,
        qualifier: &Qualifier,
        candidates: &[ServiceReference],
    ) -> Option<ServiceReference> {
        if candidates.is_empty() {
            return None;
        }

        let ticket = match self.counters.get(qualifier) {
            Some(counter) => counter.fetch_add(1, Ordering::Relaxed),
            None => self
                .counters
                .entry(qualifier.clone())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed),
        };

        candidates.get(ticket % candidates.len()).cloned()
    }
}

impl Router for RoundRobinRouter {
    fn route(&self, qualifier: &Qualifier, _context: &RoutingContext) -> Option<ServiceReference> {
        let candidates = self.registry.references_for(qualifier);
        self.select(qualifier, &candidates)
    }
}

/// Uniformly random candidate.
pub struct RandomRouter {
    registry: Arc<ServiceRegistry>,
}

impl RandomRouter {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }
}

impl Router for RandomRouter {
    fn route(&self, qualifier: &Qualifier, _context: &RoutingContext) -> Option<ServiceReference> {
        let mut candidates = self.registry.references_for(qualifier);
        if candidates.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates.swap_remove(index))
    }
}

/// Sticks calls carrying the same affinity key to the same endpoint while
/// the candidate set is unchanged. Calls without a key go round-robin.
pub struct AffinityRouter {
    round_robin: RoundRobinRouter,
}

impl AffinityRouter {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            round_robin: RoundRobinRouter::new(registry),
        }
    }
}

impl Router for AffinityRouter {
    fn route(&self, qualifier: &Qualifier, context: &RoutingContext) -> Option<ServiceReference> {
        let candidates = self.round_robin.registry().references_for(qualifier);
        match &context.affinity_key {
            Some(key) if !candidates.is_empty() => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                let index = (hasher.finish() % candidates.len() as u64) as usize;
                candidates.get(index).cloned()
            }
            _ => self.round_robin.select(qualifier, &candidates),
        }
    }
}
