//
// src/proxy/mod.rs
//
mod backend;
mod pool;
mod proxy;

pub use backend::{Backend, BackendSnapshot, STATE_INFERENCE};
pub use pool::{BackendLease, BackendPool, PoolSnapshot};
pub use proxy::{Proxy, ProxyError, SUPPORTED_METHODS};
