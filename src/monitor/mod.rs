// src/monitor/mod.rs
mod poller;

pub use poller::Monitor;
