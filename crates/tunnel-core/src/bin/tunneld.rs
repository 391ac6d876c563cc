//! Standalone worker process wrapping `tunnel_core::TunnelHandler` around a
//! stdin/stdout control link, for local development and integration testing. Not a
//! required deployment surface — embedding hosts talk to the library directly.

use std::collections::HashMap;
use std::io::Write as IoWrite;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tunnel_core::{serialize_frame, LogLevel, TunnelConfig, TunnelHandler};

#[derive(Parser)]
#[command(name = "tunneld")]
#[command(about = "Standalone tunnel-core worker: bridges stdin/stdout to local HTTP/WS upstreams")]
#[command(version)]
struct Args {
    /// Comma-separated list of remote ports permitted through the tunnel. Empty = allow all.
    #[arg(long, env = "TUNNEL_ALLOWED_PORTS", value_delimiter = ',')]
    allowed_ports: Vec<u16>,

    /// Comma-separated remote:local port mappings, e.g. "3000:30000,8080:8081".
    #[arg(long, env = "TUNNEL_PORT_MAPPING", value_delimiter = ',')]
    port_mapping: Vec<String>,

    /// Maximum number of concurrent streams admitted at once.
    #[arg(long, env = "TUNNEL_MAX_CONCURRENT_STREAMS", default_value_t = 50)]
    max_concurrent_streams: usize,

    /// Per-stream cap, in bytes, on the total response body forwarded.
    #[arg(long, env = "TUNNEL_MAX_RESPONSE_SIZE", default_value_t = 100 * 1024 * 1024)]
    max_response_size: u64,

    /// Upstream connect timeout, in seconds.
    #[arg(long, env = "TUNNEL_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    connect_timeout_secs: u64,

    /// Per-stream idle timeout, in seconds.
    #[arg(long, env = "TUNNEL_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    idle_timeout_secs: u64,

    /// Whether to overwrite Accept-Encoding with "identity" on upstream requests.
    #[arg(long, env = "TUNNEL_FORCE_IDENTITY_ENCODING", default_value_t = true)]
    force_identity_encoding: bool,

    /// Host local HTTP/WS upstreams are reached on.
    #[arg(long, env = "TUNNEL_LOCAL_HOST", default_value = "127.0.0.1")]
    local_host: String,

    /// Worker id used to build rewritten host labels; unset disables rewriting.
    #[arg(long, env = "TUNNEL_WORKER_ID")]
    worker_id: Option<String>,

    /// Whether to rewrite localhost references in rewritable response bodies.
    #[arg(long, env = "TUNNEL_ENABLE_URL_REWRITING", default_value_t = false)]
    enable_url_rewriting: bool,

    /// Domain suffix used when constructing rewritten host labels.
    #[arg(long, env = "TUNNEL_DOMAIN", default_value = "")]
    tunnel_domain: String,

    /// Default log level, used when RUST_LOG is unset.
    #[arg(long, env = "TUNNEL_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> Result<TunnelConfig> {
        let log_level: LogLevel = self
            .log_level
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("parsing --log-level")?;

        let mut port_mapping = HashMap::new();
        for entry in &self.port_mapping {
            if entry.is_empty() {
                continue;
            }
            let (remote, local) = entry
                .split_once(':')
                .with_context(|| format!("invalid --port-mapping entry {entry:?}, expected remote:local"))?;
            port_mapping.insert(
                remote.parse().context("parsing port-mapping remote port")?,
                local.parse().context("parsing port-mapping local port")?,
            );
        }

        Ok(TunnelConfig {
            allowed_ports: self.allowed_ports,
            port_mapping,
            max_concurrent_streams: self.max_concurrent_streams,
            max_response_size: self.max_response_size,
            connect_timeout: std::time::Duration::from_secs(self.connect_timeout_secs),
            idle_timeout: std::time::Duration::from_secs(self.idle_timeout_secs),
            force_identity_encoding: self.force_identity_encoding,
            local_host: self.local_host,
            worker_id: self.worker_id,
            enable_url_rewriting: self.enable_url_rewriting,
            tunnel_domain: self.tunnel_domain,
            log_level,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.into_config()?;
    tunnel_core::logging::init(config.log_level);

    tracing::info!(
        local_host = %config.local_host,
        max_concurrent_streams = config.max_concurrent_streams,
        "tunneld starting"
    );

    let (handler, mut outbound_rx) = TunnelHandler::new(config);

    // The writer side owns stdout exclusively, matching §5's single-writer
    // discipline; every emitted frame becomes one newline-delimited JSON line.
    let writer = tokio::task::spawn_blocking(move || {
        let mut stdout = std::io::stdout().lock();
        while let Some(frame) = outbound_rx.blocking_recv() {
            let line = serialize_frame(&frame);
            if writeln!(stdout, "{line}").is_err() || stdout.flush().is_err() {
                break;
            }
        }
    });

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await.context("reading control link stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        handler.dispatch_text(&line).await;
    }

    handler.shutdown();
    drop(handler);
    let _ = writer.await;

    tracing::info!("tunneld shutting down, control link closed");
    Ok(())
}
