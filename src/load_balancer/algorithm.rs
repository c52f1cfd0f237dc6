// src/load_balancer/algorithm.rs
use crate::proxy::Backend;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Choose one backend from the candidate slice. Candidates are already
    /// filtered to available backends and appear in configuration order;
    /// the pool invokes this under its selection mutex.
    async fn select_backend(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>>;

    fn name(&self) -> &'static str;
}
