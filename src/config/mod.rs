// src/config/mod.rs
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

pub const DEFAULT_REFRESH_INTERVAL: f64 = 2.0;
pub const DEFAULT_REQUEST_TIMEOUT: f64 = 30.0;
pub const DEFAULT_STATE_TIMEOUT: f64 = 5.0;
pub const DEFAULT_HEALTH_TIMEOUT: f64 = 2.0;
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Errors raised while reading the environment at startup. These are the
/// only fatal errors in the process; everything later is request-scoped.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MLNODE_BACKENDS must contain at least one backend URL")]
    NoBackends,

    #[error("invalid backend URL `{url}`: {source}")]
    InvalidBackendUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("invalid float value for {name}: {value}")]
    InvalidFloat { name: &'static str, value: String },

    #[error("invalid listen address `{value}`: {source}")]
    InvalidListenAddr {
        value: String,
        source: std::net::AddrParseError,
    },

    #[error("invalid metrics port `{value}`")]
    InvalidMetricsPort { value: String },
}

/// Immutable runtime configuration, loaded once from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Backend base URLs in configuration order, trailing slashes stripped.
    pub backend_urls: Vec<String>,
    /// Interval between monitor polls of each backend.
    pub refresh_interval: Duration,
    /// Per-read upstream timeout for proxied requests. There is no overall
    /// deadline, so long-lived streaming completions are unrestricted.
    pub request_timeout: Duration,
    /// Timeout for one `/api/v1/state` poll.
    pub state_timeout: Duration,
    /// Timeout for one `/health` poll.
    pub health_timeout: Duration,
    /// Address the balancer listens on.
    pub listen_addr: SocketAddr,
    /// Port for the sidecar Prometheus server; `None` disables it.
    pub metrics_port: Option<u16>,
}

impl Settings {
    /// Load configuration from process environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup. `load()` wires this
    /// to `std::env`; tests supply a map.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_backends = lookup("MLNODE_BACKENDS").unwrap_or_default();
        let backend_urls = parse_backend_urls(&raw_backends)?;

        let listen_addr = match lookup("MLNODE_LISTEN_ADDR") {
            Some(raw) => raw
                .parse()
                .map_err(|source| ConfigError::InvalidListenAddr { value: raw, source })?,
            None => DEFAULT_LISTEN_ADDR.parse().expect("default listen addr"),
        };

        let metrics_port = match lookup("MLNODE_METRICS_PORT") {
            Some(raw) => Some(
                raw.parse::<u16>()
                    .map_err(|_| ConfigError::InvalidMetricsPort { value: raw })?,
            ),
            None => None,
        };

        Ok(Self {
            backend_urls,
            refresh_interval: float_secs(
                &lookup,
                "MLNODE_REFRESH_INTERVAL",
                DEFAULT_REFRESH_INTERVAL,
            )?,
            request_timeout: float_secs(&lookup, "MLNODE_REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT)?,
            state_timeout: float_secs(&lookup, "MLNODE_STATE_TIMEOUT", DEFAULT_STATE_TIMEOUT)?,
            health_timeout: float_secs(&lookup, "MLNODE_HEALTH_TIMEOUT", DEFAULT_HEALTH_TIMEOUT)?,
            listen_addr,
            metrics_port,
        })
    }
}

fn parse_backend_urls(raw: &str) -> Result<Vec<String>, ConfigError> {
    let urls: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.trim_end_matches('/').to_string())
        .collect();

    if urls.is_empty() {
        return Err(ConfigError::NoBackends);
    }

    for url in &urls {
        Url::parse(url).map_err(|source| ConfigError::InvalidBackendUrl {
            url: url.clone(),
            source,
        })?;
    }

    Ok(urls)
}

fn float_secs<F>(lookup: &F, name: &'static str, default: f64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = match lookup(name) {
        Some(raw) => raw,
        None => return Ok(Duration::from_secs_f64(default)),
    };

    match raw.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
        _ => Err(ConfigError::InvalidFloat { name, value: raw }),
    }
}
