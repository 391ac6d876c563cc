//! `TunnelConfig` (§3) and its defaults (§6).

use std::collections::HashMap;
use std::time::Duration;

/// Verbosity recognized by the core itself, independent of `RUST_LOG`. Seeds the
/// default `tracing_subscriber::EnvFilter` directive when no environment override is
/// present; see [`crate::logging::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unrecognized log level: {other}")),
        }
    }
}

/// Immutable after construction, per §3. Embedding hosts build this programmatically;
/// the standalone `tunneld` binary (§10.3) fills it in from CLI flags/env vars via
/// `clap`.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub allowed_ports: Vec<u16>,
    pub port_mapping: HashMap<u16, u16>,
    pub max_concurrent_streams: usize,
    pub max_response_size: u64,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub force_identity_encoding: bool,
    pub local_host: String,
    pub worker_id: Option<String>,
    pub enable_url_rewriting: bool,
    pub tunnel_domain: String,
    pub log_level: LogLevel,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            allowed_ports: Vec::new(),
            port_mapping: HashMap::new(),
            max_concurrent_streams: 50,
            max_response_size: 100 * 1024 * 1024,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            force_identity_encoding: true,
            local_host: "127.0.0.1".to_string(),
            worker_id: None,
            enable_url_rewriting: false,
            tunnel_domain: String::new(),
            log_level: LogLevel::Info,
        }
    }
}

impl TunnelConfig {
    /// Rewriting is only active when both the flag is set and a `worker_id` is
    /// present; `worker_id` absent disables rewriting regardless of the flag (§8
    /// boundary behavior).
    pub fn rewriting_enabled(&self) -> bool {
        self.enable_url_rewriting && self.worker_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = TunnelConfig::default();
        assert_eq!(cfg.max_concurrent_streams, 50);
        assert_eq!(cfg.max_response_size, 100 * 1024 * 1024);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.idle_timeout, Duration::from_secs(60));
        assert!(cfg.force_identity_encoding);
        assert_eq!(cfg.local_host, "127.0.0.1");
    }

    #[test]
    fn rewriting_requires_both_flag_and_worker_id() {
        let mut cfg = TunnelConfig {
            enable_url_rewriting: true,
            worker_id: None,
            ..TunnelConfig::default()
        };
        assert!(!cfg.rewriting_enabled());
        cfg.worker_id = Some("w1".to_string());
        assert!(cfg.rewriting_enabled());
        cfg.enable_url_rewriting = false;
        assert!(!cfg.rewriting_enabled());
    }
}
