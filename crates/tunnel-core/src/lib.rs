//! Bidirectional HTTP/WebSocket tunnel multiplexer over a single control link.
//!
//! Embedding hosts construct a [`TunnelConfig`], build a [`handler::TunnelHandler`]
//! from it, feed inbound control-link text frames to `dispatch_text`/`dispatch`, and
//! drive the returned `UnboundedReceiver<Frame>` to whatever writes the link. No CLI
//! or transport surface lives in this crate's library half — `src/bin/tunneld.rs`
//! wraps it into a standalone process for local development and integration testing.

pub mod config;
pub mod error;
pub mod frame;
pub mod handler;
pub mod headers;
pub mod http_engine;
pub mod logging;
pub mod outbound;
pub mod policy;
pub mod registry;
pub mod rewrite;
pub mod ws_bridge;

pub use config::{LogLevel, TunnelConfig};
pub use error::{TunnelError, TunnelResult};
pub use frame::{parse_frame, serialize_frame, Frame, StreamId};
pub use handler::TunnelHandler;
pub use outbound::OutboundSender;
pub use registry::StreamRegistry;
