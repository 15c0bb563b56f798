use std::sync::Arc;

use meshrpc_common::Qualifier;
use rand::Rng;

use crate::endpoint::ServiceReference;
use crate::registry::ServiceRegistry;
use crate::router::{RoundRobinRouter, Router, RoutingContext};

/// Tag carrying a candidate's traffic share. Matched ignoring case.
pub const WEIGHT_TAG: &str = "weight";

/// Tag-filtered router, used for canary traffic splits.
///
/// Candidates are first narrowed to those matching every required tag of
/// the [`RoutingContext`]. If any remaining candidate carries a positive
/// numeric `weight` tag, one is drawn at random in proportion to its weight
/// (candidates without a usable weight get nothing). Otherwise the filtered
/// set is served round-robin.
pub struct TagRouter {
    round_robin: RoundRobinRouter,
    weight_tag: String,
}

impl TagRouter {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            round_robin: RoundRobinRouter::new(registry),
            weight_tag: WEIGHT_TAG.to_string(),
        }
    }

    /// Reads weights from another tag.
    pub fn with_weight_tag(mut self, tag: impl Into<String>) -> Self {
        self.weight_tag = tag.into();
        self
    }

    fn weight_of(&self, reference: &ServiceReference) -> f64 {
        reference
            .tag(&self.weight_tag)
            .and_then(|w| w.trim().parse::<f64>().ok())
            .filter(|w| w.is_finite() && *w > 0.0)
            .unwrap_or(0.0)
    }

    fn pick_weighted(&self, candidates: &[ServiceReference]) -> Option<ServiceReference> {
        let weights: Vec<f64> = candidates.iter().map(|c| self.weight_of(c)).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return None;
        }

        let mut point = rand::thread_rng().gen::<f64>() * total;
        for (candidate, weight) in candidates.iter().zip(&weights) {
            if *weight <= 0.0 {
                continue;
            }
            if point < *weight {
                return Some(candidate.clone());
            }
            point -= weight;
        }
        // Rounding can leave `point` just past the last bucket.
        candidates
            .iter()
            .zip(&weights)
            .rev()
            .find(|(_, w)| **w > 0.0)
            .map(|(c, _)| c.clone())
    }
}

impl Router for TagRouter {
    fn route(&self, qualifier: &Qualifier, context: &RoutingContext) -> Option<ServiceReference> {
        let candidates: Vec<ServiceReference> = self
            .round_robin
            .registry()
            .references_for(qualifier)
            .into_iter()
            .filter(|reference| context.matches(reference))
            .collect();

        if candidates.is_empty() {
            return None;
        }
        self.pick_weighted(&candidates)
            .or_else(|| self.round_robin.select(qualifier, &candidates))
    }
}
