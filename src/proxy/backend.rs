// src/proxy/backend.rs
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::Serialize;

/// Lifecycle state a backend must report before it receives inference
/// traffic.
pub const STATE_INFERENCE: &str = "INFERENCE";

/// A single MLNode backend instance behind the balancer.
///
/// All runtime fields are lock-free: the monitor writes `state`/`healthy`
/// while selection reads them, and the active-request counter is bumped
/// under the pool's selection mutex and released from `Drop` impls.
#[derive(Debug)]
pub struct Backend {
    url: String,

    // Runtime state, refreshed by the monitor
    state: ArcSwapOption<String>,
    healthy: AtomicBool,
    active_requests: AtomicUsize,
}

impl Backend {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: ArcSwapOption::const_empty(),
            healthy: AtomicBool::new(false),
            active_requests: AtomicUsize::new(0),
        }
    }

    /// Base URL with no trailing slash.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Last state reported by `/api/v1/state`; `None` if the last poll
    /// failed.
    pub fn state(&self) -> Option<Arc<String>> {
        self.state.load_full()
    }

    pub fn set_state(&self, state: Option<String>) {
        self.state.store(state.map(Arc::new));
    }

    pub fn healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    /// Count one more in-flight request against this backend.
    pub fn mark_request_start(&self) {
        self.active_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Count one in-flight request as finished. Clamped at zero: going
    /// negative would mean a release ran without a matching start.
    pub fn mark_request_done(&self) {
        loop {
            let current = self.active_requests.load(Ordering::Relaxed);
            if current == 0 {
                tracing::warn!(url = %self.url, "request accounting underflow");
                return;
            }

            if self
                .active_requests
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok() {
                return;
            }
        }
    }

    /// A backend takes inference traffic only when its last health poll
    /// passed and it reported the INFERENCE state.
    pub fn is_available(&self) -> bool {
        self.healthy() && self.state().as_deref().map(String::as_str) == Some(STATE_INFERENCE)
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            url: self.url.clone(),
            state: self.state().map(|s| s.as_ref().clone()),
            healthy: self.healthy(),
            active_requests: self.active_requests(),
        }
    }
}

/// Point-in-time view of one backend, as reported by `/api/v1/state`.
/// Each field is read independently; the snapshot is for reporting, not
/// for invariants.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub url: String,
    pub state: Option<String>,
    pub healthy: bool,
    pub active_requests: usize,
}
