//! Tunnel Handler (C8).
//!
//! Owns the control link: the inbound frame stream and the single outbound sender.
//! Dispatches `REQUEST`/`DATA`/`END` to the HTTP engine and `WS_UPGRADE`/`WS_DATA`/
//! `WS_CLOSE` to the WebSocket bridge, the way `wesamahakem-goose`'s message loop
//! dispatches on an incoming message's kind before running its own cleanup on exit.

use std::sync::Arc;

use crate::config::TunnelConfig;
use crate::frame::{parse_frame, serialize_frame, Frame};
use crate::http_engine::HttpEngine;
use crate::outbound::{self, OutboundSender};
use crate::policy::PortPolicy;
use crate::registry::StreamRegistry;
use crate::ws_bridge::WsBridge;

/// One tunnel handler per control link. Construct it, then drive `dispatch` with
/// every inbound text frame and `writer` (the `mpsc::UnboundedReceiver` half of
/// `outbound::channel`) with whatever sends frames out over the transport.
pub struct TunnelHandler {
    config: Arc<TunnelConfig>,
    policy: Arc<PortPolicy>,
    registry: Arc<StreamRegistry>,
    http_engine: Arc<HttpEngine>,
    ws_bridge: Arc<WsBridge>,
    outbound: OutboundSender,
}

impl TunnelHandler {
    /// Builds a handler and its outbound channel. Callers own driving the returned
    /// `UnboundedReceiver<Frame>` to the actual transport — `TunnelHandler` never
    /// writes to the link directly, keeping the single-writer discipline (§5) visible
    /// at the call site rather than hidden inside this type.
    pub fn new(config: TunnelConfig) -> (Self, tokio::sync::mpsc::UnboundedReceiver<Frame>) {
        let (outbound, rx) = outbound::channel();
        let config = Arc::new(config);
        let policy = Arc::new(PortPolicy::new(
            config.allowed_ports.clone(),
            config.port_mapping.clone(),
        ));
        let handler = TunnelHandler {
            registry: Arc::new(StreamRegistry::new(config.max_concurrent_streams)),
            http_engine: Arc::new(HttpEngine::new()),
            ws_bridge: Arc::new(WsBridge::new()),
            outbound,
            policy,
            config,
        };
        (handler, rx)
    }

    /// Number of streams currently tracked by the registry.
    pub fn active_stream_count(&self) -> usize {
        self.registry.size()
    }

    /// Parses and dispatches one inbound text frame. Malformed text is logged and
    /// dropped (§7 kind 1); the link stays up regardless.
    pub async fn dispatch_text(&self, text: &str) {
        match parse_frame(text) {
            Ok(frame) => self.dispatch(frame).await,
            Err(err) => tracing::warn!(error = %err, "dropping malformed inbound frame"),
        }
    }

    /// Routes one already-parsed inbound frame to its owning component.
    pub async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Request {
                stream_id,
                port,
                method,
                path,
                headers,
                scheme,
                worker_id,
                deadline_ms,
            } => {
                self.http_engine.handle_request(
                    &self.registry,
                    &self.outbound,
                    &self.config,
                    &self.policy,
                    stream_id,
                    port,
                    method,
                    path,
                    headers,
                    scheme,
                    worker_id,
                    deadline_ms,
                );
            }
            Frame::Data { stream_id, payload } => {
                if self.registry.contains(&stream_id) {
                    self.http_engine.handle_data(
                        &self.registry,
                        &self.outbound,
                        self.config.idle_timeout,
                        &stream_id,
                        payload.0,
                    );
                } else {
                    tracing::warn!(stream_id, "dropping DATA for unknown stream");
                }
            }
            Frame::End { stream_id } => {
                self.http_engine.handle_end(&stream_id);
            }
            Frame::WsUpgrade {
                stream_id,
                port,
                path,
                headers,
            } => {
                self.ws_bridge.handle_upgrade(
                    &self.registry,
                    &self.outbound,
                    &self.policy,
                    &self.config.local_host,
                    self.config.idle_timeout,
                    stream_id,
                    port,
                    path,
                    headers,
                );
            }
            Frame::WsData {
                stream_id,
                payload,
                is_binary,
            } => {
                self.ws_bridge.handle_data(
                    &self.registry,
                    &self.outbound,
                    self.config.idle_timeout,
                    &stream_id,
                    payload.0,
                    is_binary,
                );
            }
            Frame::WsClose {
                stream_id,
                code,
                reason,
            } => {
                self.ws_bridge.handle_close(&stream_id, code, reason);
            }
            // RESPONSE and ERROR only ever flow outbound; receiving one inbound is
            // not a wire-format violation worth tearing the link down over, but it
            // is never something this handler is meant to act on.
            Frame::Response { stream_id, .. } | Frame::Error { stream_id, .. } => {
                tracing::warn!(stream_id, "dropping outbound-only frame kind received inbound");
            }
        }
    }

    /// Emits one frame's serialized text form — a convenience for callers that want
    /// to pair `dispatch_text` with a matching synchronous serializer rather than
    /// draining the outbound receiver themselves.
    pub fn serialize(frame: &Frame) -> String {
        serialize_frame(frame)
    }

    /// Cleans up every live stream with a shutdown reason (§4.8, §7 kind 10). Call
    /// this once the control link itself has closed; no further frames are emitted
    /// for any stream after this returns.
    pub fn shutdown(&self) {
        for stream_id in self.registry.iter_for_shutdown() {
            tracing::info!(stream_id, "cleaning up stream on handler shutdown");
            self.http_engine.cleanup(&stream_id);
            self.ws_bridge.cleanup(&stream_id);
            self.registry.remove(&stream_id);
        }
    }

    /// Direct access to the shared `OutboundSender`, for embedding hosts that want to
    /// emit their own out-of-band frames (e.g. a keepalive) alongside the handler's.
    pub fn outbound(&self) -> &OutboundSender {
        &self.outbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn disallowed_port_emits_single_403_and_admits_no_stream() {
        let config = TunnelConfig {
            allowed_ports: vec![3000],
            ..TunnelConfig::default()
        };
        let (handler, mut rx) = TunnelHandler::new(config);

        handler
            .dispatch(Frame::Request {
                stream_id: "s1".to_string(),
                port: 8080,
                method: "GET".to_string(),
                path: "/".to_string(),
                headers: HashMap::new(),
                scheme: None,
                worker_id: None,
                deadline_ms: None,
            })
            .await;

        let frame = rx.try_recv().expect("expected one ERROR frame");
        match frame {
            Frame::Error { status_code, .. } => assert_eq!(status_code, Some(403)),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(handler.active_stream_count(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn over_cap_admission_emits_503_and_preserves_size() {
        let config = TunnelConfig {
            max_concurrent_streams: 1,
            ..TunnelConfig::default()
        };
        let (handler, mut rx) = TunnelHandler::new(config);

        handler
            .dispatch(Frame::Request {
                stream_id: "s1".to_string(),
                port: 65000,
                method: "GET".to_string(),
                path: "/".to_string(),
                headers: HashMap::new(),
                scheme: None,
                worker_id: None,
                deadline_ms: None,
            })
            .await;
        assert_eq!(handler.active_stream_count(), 1);

        handler
            .dispatch(Frame::Request {
                stream_id: "s2".to_string(),
                port: 65000,
                method: "GET".to_string(),
                path: "/".to_string(),
                headers: HashMap::new(),
                scheme: None,
                worker_id: None,
                deadline_ms: None,
            })
            .await;

        // Drain the first stream's own in-flight upstream-failure ERROR (port 65000
        // has nothing listening) before inspecting the admission-denial frame.
        let mut saw_503 = false;
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Error { stream_id, status_code, .. } = &frame {
                if stream_id == "s2" {
                    assert_eq!(*status_code, Some(503));
                    saw_503 = true;
                }
            }
        }
        assert!(saw_503, "expected an ERROR 503 for the rejected second stream");
        assert_eq!(handler.active_stream_count(), 1);
    }

    #[tokio::test]
    async fn data_for_unknown_stream_is_dropped_without_emitting() {
        let (handler, mut rx) = TunnelHandler::new(TunnelConfig::default());
        handler
            .dispatch(Frame::data("missing", b"hi".to_vec()))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_empties_the_registry() {
        let (handler, _rx) = TunnelHandler::new(TunnelConfig::default());
        handler
            .dispatch(Frame::Request {
                stream_id: "s1".to_string(),
                port: 65000,
                method: "GET".to_string(),
                path: "/".to_string(),
                headers: HashMap::new(),
                scheme: None,
                worker_id: None,
                deadline_ms: None,
            })
            .await;
        assert_eq!(handler.active_stream_count(), 1);
        handler.shutdown();
        assert_eq!(handler.active_stream_count(), 0);
    }
}
