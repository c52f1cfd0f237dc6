// src/proxy/pool.rs
use super::backend::{Backend, BackendSnapshot};
use super::proxy::ProxyError;
use crate::config::Settings;
use crate::load_balancer::{LeastActiveBalancer, LoadBalancer};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Aggregate-state reduction priority: the first of these found among the
/// backends' reported states wins.
const STATE_PRIORITY: [&str; 4] = ["INFERENCE", "POW", "TRAIN", "STOPPED"];
const STATE_STOPPED: &str = "STOPPED";

/// The set of MLNode backends, in configuration order.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    balancer: Box<dyn LoadBalancer>,
    pick_lock: Mutex<()>,
}

impl BackendPool {
    pub fn new(settings: &Settings) -> Self {
        Self::from_urls(settings.backend_urls.iter().cloned())
    }

    pub fn from_urls<I>(urls: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            backends: urls
                .into_iter()
                .map(|url| Arc::new(Backend::new(url)))
                .collect(),
            balancer: Box::new(LeastActiveBalancer::new()),
            pick_lock: Mutex::new(()),
        }
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Select an available backend for one inference request.
    ///
    /// The whole read-filter-pick-bump sequence runs under the selection
    /// mutex, and the winner's counter is bumped before the mutex drops, so
    /// two concurrent picks can never both observe the same minimum and
    /// converge on one backend without the second seeing the first's
    /// increment. The mutex is held only across this arithmetic, never
    /// across I/O.
    pub async fn pick(&self) -> Result<BackendLease, ProxyError> {
        let _serialized = self.pick_lock.lock().await;

        let candidates: Vec<Arc<Backend>> = self
            .backends
            .iter()
            .filter(|backend| backend.is_available())
            .cloned()
            .collect();

        let backend = self
            .balancer
            .select_backend(&candidates)
            .await
            .ok_or(ProxyError::NoHealthyBackends)?;

        backend.mark_request_start();
        Ok(BackendLease::new(backend))
    }

    /// Lease the first configured backend regardless of its health, for the
    /// legacy passthrough surface. The counter is still bumped so reporting
    /// stays consistent.
    pub fn lease_first(&self) -> Result<BackendLease, ProxyError> {
        let backend = self
            .backends
            .first()
            .cloned()
            .ok_or(ProxyError::NoBackendsConfigured)?;

        backend.mark_request_start();
        Ok(BackendLease::new(backend))
    }

    pub fn any_available(&self) -> bool {
        self.backends.iter().any(|backend| backend.is_available())
    }

    /// Highest-priority lifecycle state across all backends; `"STOPPED"`
    /// when no backend has a known state.
    pub fn aggregate_state(&self) -> String {
        let states: Vec<Arc<String>> = self
            .backends
            .iter()
            .filter_map(|backend| backend.state())
            .collect();

        for state in STATE_PRIORITY {
            if states.iter().any(|known| known.as_str() == state) {
                return state.to_string();
            }
        }
        STATE_STOPPED.to_string()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            state: self.aggregate_state(),
            nodes: self.backends.iter().map(|b| b.snapshot()).collect(),
        }
    }
}

/// Pool-wide view served at `/api/v1/state`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub state: String,
    pub nodes: Vec<BackendSnapshot>,
}

/// Accounting lease for one proxied request.
///
/// Every lease was counted by `mark_request_start` exactly once; dropping
/// the lease is the one and only release. The proxy moves the lease into
/// the response body stream, so release happens when the body is fully
/// delivered, the client disconnects, or the stream fails, whichever
/// comes first.
#[derive(Debug)]
pub struct BackendLease {
    backend: Arc<Backend>,
}

impl BackendLease {
    fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.backend.mark_request_done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::backend::STATE_INFERENCE;

    fn pool_of(urls: &[&str]) -> BackendPool {
        BackendPool::from_urls(urls.iter().copied())
    }

    fn make_available(backend: &Backend) {
        backend.set_healthy(true);
        backend.set_state(Some(STATE_INFERENCE.to_string()));
    }

    #[tokio::test]
    async fn pick_fails_without_available_backends() {
        let pool = pool_of(&["http://b1", "http://b2"]);

        let err = pool.pick().await.unwrap_err();
        assert!(matches!(err, ProxyError::NoHealthyBackends));
        for backend in pool.backends() {
            assert_eq!(backend.active_requests(), 0);
        }

        // Healthy but not in INFERENCE state is still unavailable.
        pool.backends()[0].set_healthy(true);
        pool.backends()[0].set_state(Some("POW".to_string()));
        assert!(matches!(
            pool.pick().await.unwrap_err(),
            ProxyError::NoHealthyBackends
        ));
    }

    #[tokio::test]
    async fn pick_prefers_least_active_with_stable_ties() {
        let pool = pool_of(&["http://b1", "http://b2", "http://b3"]);
        for backend in pool.backends() {
            make_available(backend);
        }
        for _ in 0..3 {
            pool.backends()[0].mark_request_start();
        }
        pool.backends()[1].mark_request_start();
        pool.backends()[2].mark_request_start();

        let lease = pool.pick().await.unwrap();
        assert_eq!(lease.backend().url(), "http://b2");
        assert_eq!(lease.backend().active_requests(), 2);
    }

    #[tokio::test]
    async fn lease_drop_releases_exactly_once() {
        let pool = pool_of(&["http://b1"]);
        make_available(&pool.backends()[0]);

        let lease = pool.pick().await.unwrap();
        assert_eq!(pool.backends()[0].active_requests(), 1);

        drop(lease);
        assert_eq!(pool.backends()[0].active_requests(), 0);
    }

    #[tokio::test]
    async fn concurrent_picks_spread_within_one() {
        let pool = Arc::new(pool_of(&["http://b1", "http://b2", "http://b3"]));
        for backend in pool.backends() {
            make_available(backend);
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.pick().await.unwrap() }));
        }

        let mut leases = Vec::new();
        for task in tasks {
            leases.push(task.await.unwrap());
        }

        let counts: Vec<usize> = pool
            .backends()
            .iter()
            .map(|backend| backend.active_requests())
            .collect();
        assert_eq!(counts.iter().sum::<usize>(), 8);
        let min = counts.iter().min().unwrap();
        let max = counts.iter().max().unwrap();
        assert!(max - min <= 1, "uneven spread: {counts:?}");

        drop(leases);
        for backend in pool.backends() {
            assert_eq!(backend.active_requests(), 0);
        }
    }

    #[tokio::test]
    async fn lease_first_bypasses_selection() {
        let pool = pool_of(&["http://b1", "http://b2"]);

        // No health or state required for the passthrough surface.
        let lease = pool.lease_first().unwrap();
        assert_eq!(lease.backend().url(), "http://b1");
        assert_eq!(pool.backends()[0].active_requests(), 1);
        drop(lease);
        assert_eq!(pool.backends()[0].active_requests(), 0);

        let empty = BackendPool::from_urls(Vec::<String>::new());
        assert!(matches!(
            empty.lease_first().unwrap_err(),
            ProxyError::NoBackendsConfigured
        ));
    }

    #[test]
    fn aggregate_state_follows_priority() {
        let pool = pool_of(&["http://b1", "http://b2", "http://b3"]);
        assert_eq!(pool.aggregate_state(), "STOPPED");

        pool.backends()[0].set_state(Some("TRAIN".to_string()));
        pool.backends()[1].set_state(Some("POW".to_string()));
        assert_eq!(pool.aggregate_state(), "POW");

        pool.backends()[2].set_state(Some("INFERENCE".to_string()));
        assert_eq!(pool.aggregate_state(), "INFERENCE");

        for backend in pool.backends() {
            backend.set_state(None);
        }
        assert_eq!(pool.aggregate_state(), "STOPPED");
    }

    #[test]
    fn snapshot_carries_aggregate_and_nodes() {
        let pool = pool_of(&["http://b1", "http://b2"]);
        pool.backends()[0].set_state(Some("INFERENCE".to_string()));
        pool.backends()[0].set_healthy(true);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.state, "INFERENCE");
        assert_eq!(snapshot.nodes.len(), 2);
        assert_eq!(snapshot.nodes[0].url, "http://b1");
        assert!(!snapshot.nodes[1].healthy);

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["nodes"][1]["state"], serde_json::Value::Null);
        assert_eq!(value["state"], "INFERENCE");
    }
}
