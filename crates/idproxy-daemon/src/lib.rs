//! Daemon wiring for the identity-token forwarding proxy: configuration,
//! HTTP listener, liveness endpoint and graceful shutdown.

pub mod config;
pub mod error;
pub mod health;
pub mod server;

pub use config::ProxyConfig;
pub use error::{DaemonError, Result};
