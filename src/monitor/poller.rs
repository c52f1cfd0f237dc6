// src/monitor/poller.rs
use crate::config::Settings;
use crate::metrics::MetricsCollector;
use crate::proxy::{Backend, BackendPool};
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Spawns and owns the background pollers that keep every backend's
/// `state`/`healthy` fields current.
pub struct Monitor {
    settings: Arc<Settings>,
    client: Client,
    metrics: Arc<MetricsCollector>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Monitor {
    pub fn new(settings: Arc<Settings>, client: Client, metrics: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            settings,
            client,
            metrics,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawn one independent polling task per backend. The returned handles
    /// are awaited at shutdown.
    pub fn start(&self, pool: &Arc<BackendPool>) -> Vec<JoinHandle<()>> {
        info!(
            interval = ?self.settings.refresh_interval,
            backends = pool.backends().len(),
            "starting backend monitors"
        );

        pool.backends()
            .iter()
            .cloned()
            .map(|backend| {
                let poller = BackendPoller {
                    backend,
                    pool: pool.clone(),
                    client: self.client.clone(),
                    settings: self.settings.clone(),
                    metrics: self.metrics.clone(),
                    shutdown_rx: self.shutdown_rx.clone(),
                };
                tokio::spawn(poller.run())
            })
            .collect()
    }

    /// Signal every poller to stop after its current iteration.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// One backend's polling loop. Pollers do not coordinate; each backend is
/// refreshed on its own schedule.
struct BackendPoller {
    backend: Arc<Backend>,
    pool: Arc<BackendPool>,
    client: Client,
    settings: Arc<Settings>,
    metrics: Arc<MetricsCollector>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BackendPoller {
    async fn run(mut self) {
        debug!(url = %self.backend.url(), "monitor started");

        loop {
            self.poll_once().await;

            tokio::select! {
                _ = sleep(self.settings.refresh_interval) => {}
                changed = self.shutdown_rx.changed() => {
                    // A closed channel means the monitor is gone; stop too.
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        debug!(url = %self.backend.url(), "monitor stopped");
    }

    async fn poll_once(&self) {
        let was_healthy = self.backend.healthy();

        let state = self.fetch_state().await;
        self.backend.set_state(state);

        let healthy = self.fetch_health().await;
        self.backend.set_healthy(healthy);

        if healthy && !was_healthy {
            info!(url = %self.backend.url(), "backend became healthy");
        } else if !healthy && was_healthy {
            warn!(url = %self.backend.url(), "backend became unhealthy");
        }

        self.metrics
            .update_backend(self.backend.url(), healthy, self.backend.active_requests());
        self.metrics.update_available(
            self.pool
                .backends()
                .iter()
                .filter(|backend| backend.is_available())
                .count(),
        );
    }

    /// One `/api/v1/state` poll. Any failure (network, timeout, non-200,
    /// non-JSON, missing key) collapses to `None`.
    async fn fetch_state(&self) -> Option<String> {
        let url = format!("{}/api/v1/state", self.backend.url());

        let fetch = async {
            let response = self.client.get(&url).send().await.ok()?;
            if response.status() != reqwest::StatusCode::OK {
                return None;
            }
            let body: serde_json::Value = response.json().await.ok()?;
            body.get("state")
                .and_then(|value| value.as_str())
                .map(str::to_string)
        };

        timeout(self.settings.state_timeout, fetch)
            .await
            .unwrap_or(None)
    }

    /// One `/health` poll; healthy means HTTP 200, anything else is not.
    async fn fetch_health(&self) -> bool {
        let url = format!("{}/health", self.backend.url());

        let fetch = async {
            self.client
                .get(&url)
                .send()
                .await
                .map(|response| response.status() == reqwest::StatusCode::OK)
                .unwrap_or(false)
        };

        timeout(self.settings.health_timeout, fetch)
            .await
            .unwrap_or(false)
    }
}
