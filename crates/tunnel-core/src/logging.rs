//! Logging init (§10.1). A thin wrapper around `tracing_subscriber`; the standalone
//! `tunneld` binary calls this once at startup. Library consumers embedding
//! `tunnel-core` in a larger host process are free to install their own subscriber
//! instead and skip this entirely — nothing else in the crate assumes it was called.

use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Installs a `tracing_subscriber::fmt` subscriber. `RUST_LOG`, when set, always wins;
/// otherwise `default_level` (typically `TunnelConfig.log_level`) seeds the filter.
pub fn init(default_level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.as_filter_directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .ok();
}
