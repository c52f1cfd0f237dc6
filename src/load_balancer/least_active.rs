// src/load_balancer/least_active.rs
use crate::load_balancer::LoadBalancer;
use crate::proxy::Backend;
use async_trait::async_trait;
use std::sync::Arc;

/// Picks the candidate with the fewest in-flight requests. Ties go to the
/// earliest candidate in configuration order.
pub struct LeastActiveBalancer;

impl LeastActiveBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastActiveBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LoadBalancer for LeastActiveBalancer {
    async fn select_backend(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        let mut chosen: Option<&Arc<Backend>> = None;
        let mut lowest = usize::MAX;

        for candidate in candidates {
            let active = candidate.active_requests();
            // Strict comparison keeps the first candidate on ties.
            if active < lowest {
                lowest = active;
                chosen = Some(candidate);
            }
        }

        chosen.cloned()
    }

    fn name(&self) -> &'static str {
        "least_active"
    }
}
