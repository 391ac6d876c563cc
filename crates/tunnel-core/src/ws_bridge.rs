//! WebSocket Bridge (C7).
//!
//! Dials a local WebSocket server as a client and bridges frames between it and the
//! control link's `WS_DATA`/`WS_CLOSE` traffic for one stream. Shaped after
//! `cmux-xterm`'s `attach_socket`: split the socket into a send half and a receive
//! half, drive the send half from a channel so the dispatch path never blocks on a
//! slow local upstream, and drain the receive half in a loop that forwards each
//! message outbound as it arrives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::frame::{Frame as WireFrame, StreamId};
use crate::outbound::OutboundSender;
use crate::policy::PortPolicy;
use crate::registry::{Stream, StreamRegistry, UpstreamKind};

/// Events forwarded from the dispatch loop to a stream's local-WS-writing task.
enum InboundEvent {
    Data(Vec<u8>, bool),
    Close(Option<u16>, Option<String>),
}

/// Bridges WebSocket streams. Holds a side table routing inbound `WS_DATA`/`WS_CLOSE`
/// frames to the task currently driving each stream's local WebSocket connection.
pub struct WsBridge {
    inbound: DashMap<StreamId, mpsc::UnboundedSender<InboundEvent>>,
}

impl WsBridge {
    pub fn new() -> Self {
        WsBridge {
            inbound: DashMap::new(),
        }
    }

    /// Handles an inbound `TUNNEL_WS_UPGRADE` frame (§4.7 steps 1-3; steps 4-7 happen
    /// inside the spawned bridge task once the local socket opens).
    #[allow(clippy::too_many_arguments)]
    pub fn handle_upgrade(
        self: &Arc<Self>,
        registry: &Arc<StreamRegistry>,
        outbound: &OutboundSender,
        policy: &Arc<PortPolicy>,
        local_host: &str,
        idle_timeout: Duration,
        stream_id: StreamId,
        port: u16,
        path: String,
        headers: HashMap<String, String>,
    ) {
        if !policy.is_allowed(port) {
            outbound.emit(WireFrame::error(
                stream_id,
                &crate::error::TunnelError::PolicyDenied(port),
            ));
            return;
        }

        let local_port = policy.resolve_local(port);
        let stream = Arc::new(Stream::new(
            stream_id.clone(),
            None,
            port,
            local_port,
            "ws".to_string(),
            "WS".to_string(),
            path.clone(),
        ));
        stream.set_upstream_kind(UpstreamKind::WsOpen);

        if let Err(err) = registry.insert(stream.clone()) {
            outbound.emit(WireFrame::error(stream_id, &err));
            return;
        }

        // Unbounded for the same reason as `HttpEngine`: `handle_data`/`handle_close`
        // are called directly from the single control-link dispatch loop and must
        // never suspend on a slow or stalled local websocket. The `writer` task
        // spawned in `drive_ws_stream` is what blocks on the actual local socket.
        let (tx, rx) = mpsc::unbounded_channel::<InboundEvent>();
        self.inbound.insert(stream_id.clone(), tx);

        let bridge = self.clone();
        let registry_for_task = registry.clone();
        let outbound_for_task = outbound.clone();
        let local_host = local_host.to_string();
        let bind_target = stream.clone();
        let handle = tokio::spawn(async move {
            drive_ws_stream(
                bridge,
                registry_for_task,
                outbound_for_task,
                stream,
                local_host,
                local_port,
                path,
                headers,
                idle_timeout,
                rx,
            )
            .await;
        });
        // Bound so that a timer-triggered `registry.remove` (idle expiry) actually
        // stops this task rather than just dropping the registry entry out from
        // under one still running.
        bind_target.bind_upstream_task(handle);
    }

    /// Forwards an inbound `WS_DATA` frame to the stream's local-WS-writing task and
    /// rearms the idle timer (§4.7: live-stream `WS_DATA` resets it same as HTTP).
    /// Synchronous and non-suspending by construction (`UnboundedSender::send` never
    /// awaits), so a stalled local upstream on one stream can never hold up the
    /// single control-link dispatch loop that calls this for every stream.
    pub fn handle_data(
        self: &Arc<Self>,
        registry: &Arc<StreamRegistry>,
        outbound: &OutboundSender,
        idle_timeout: Duration,
        stream_id: &str,
        bytes: Vec<u8>,
        is_binary: bool,
    ) {
        let sender = self.inbound.get(stream_id).map(|e| e.clone());
        match sender {
            Some(tx) => {
                if tx.send(InboundEvent::Data(bytes, is_binary)).is_err() {
                    tracing::warn!(stream_id, "ws stream channel closed, dropping data");
                } else if let Some(stream) = registry.get(stream_id) {
                    rearm_idle_timer(self.clone(), registry, outbound, stream_id, &stream, idle_timeout);
                }
            }
            None => tracing::warn!(stream_id, "ws data frame for unknown stream, dropping"),
        }
    }

    /// Forwards an inbound `WS_CLOSE` frame, instructing the bridge task to close the
    /// local connection with the given code/reason. Synchronous for the same reason
    /// as `handle_data`.
    pub fn handle_close(&self, stream_id: &str, code: Option<u16>, reason: Option<String>) {
        if let Some(tx) = self.inbound.get(stream_id).map(|e| e.clone()) {
            let _ = tx.send(InboundEvent::Close(code, reason));
        }
    }

    /// Drops the routing entry for `stream_id`. Safe to call on an absent id.
    pub fn cleanup(&self, stream_id: &str) {
        self.inbound.remove(stream_id);
    }
}

impl Default for WsBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive_ws_stream(
    bridge: Arc<WsBridge>,
    registry: Arc<StreamRegistry>,
    outbound: OutboundSender,
    stream: Arc<Stream>,
    local_host: String,
    local_port: u16,
    path: String,
    headers: HashMap<String, String>,
    idle_timeout: Duration,
    mut inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
) {
    let stream_id = stream.stream_id.clone();
    let url = format!("ws://{local_host}:{local_port}{path}");

    let mut request = match url.as_str().into_client_request() {
        Ok(req) => req,
        Err(e) => {
            outbound.emit(WireFrame::error(
                stream_id.clone(),
                &crate::error::TunnelError::UpstreamFailure(e.to_string()),
            ));
            finish(&bridge, &registry, &stream_id);
            return;
        }
    };
    for (key, value) in &headers {
        let (Ok(name), Ok(val)) = (
            HeaderName::from_bytes(key.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        request.headers_mut().insert(name, val);
    }

    let (ws, _response) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            outbound.emit(WireFrame::error(
                stream_id.clone(),
                &crate::error::TunnelError::UpstreamFailure(e.to_string()),
            ));
            finish(&bridge, &registry, &stream_id);
            return;
        }
    };

    outbound.emit(WireFrame::Response {
        stream_id: stream_id.clone(),
        status_code: 101,
        status_message: Some("Switching Protocols".to_string()),
        headers: HashMap::new(),
    });

    let (mut local_tx, mut local_rx) = ws.split();

    let writer_stream_id = stream_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = inbound_rx.recv().await {
            let outcome = match event {
                InboundEvent::Data(bytes, is_binary) => {
                    let msg = if is_binary {
                        WsMessage::Binary(bytes)
                    } else {
                        WsMessage::Text(String::from_utf8_lossy(&bytes).into_owned())
                    };
                    local_tx.send(msg).await
                }
                InboundEvent::Close(code, reason) => {
                    let frame = close_frame(code, reason);
                    let result = local_tx.send(WsMessage::Close(frame)).await;
                    let _ = local_tx.close().await;
                    result
                }
            };
            if outcome.is_err() {
                tracing::warn!(stream_id = %writer_stream_id, "local websocket write failed");
                break;
            }
        }
    });

    loop {
        match local_rx.next().await {
            Some(Ok(message)) => {
                rearm_idle_timer(bridge.clone(), &registry, &outbound, &stream_id, &stream, idle_timeout);
                match message {
                    WsMessage::Text(text) => {
                        outbound.emit(WireFrame::ws_data(stream_id.clone(), text.into_bytes(), false));
                    }
                    WsMessage::Binary(bytes) => {
                        outbound.emit(WireFrame::ws_data(stream_id.clone(), bytes, true));
                    }
                    WsMessage::Close(frame) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), Some(f.reason.to_string())))
                            .unwrap_or((None, None));
                        outbound.emit(crate::frame::Frame::WsClose {
                            stream_id: stream_id.clone(),
                            code,
                            reason,
                        });
                        break;
                    }
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
                }
            }
            Some(Err(e)) => {
                outbound.emit(WireFrame::error(
                    stream_id.clone(),
                    &crate::error::TunnelError::UpstreamFailure(e.to_string()),
                ));
                break;
            }
            None => {
                outbound.emit(crate::frame::Frame::WsClose {
                    stream_id: stream_id.clone(),
                    code: None,
                    reason: None,
                });
                break;
            }
        }
    }

    writer.abort();
    finish(&bridge, &registry, &stream_id);
}

fn close_frame(code: Option<u16>, reason: Option<String>) -> Option<CloseFrame<'static>> {
    code.map(|code| CloseFrame {
        code: code.into(),
        reason: reason.unwrap_or_default().into(),
    })
}

/// Rearms the idle timer, mirroring `http_engine`'s identically-named helper: on
/// fire, `finish` drops this stream's `self.inbound` routing entry before removing
/// it from the registry, or the `writer` task spawned in `drive_ws_stream` is left
/// awaiting `inbound_rx.recv()` forever with nothing left to abort it.
fn rearm_idle_timer(
    bridge: Arc<WsBridge>,
    registry: &Arc<StreamRegistry>,
    outbound: &OutboundSender,
    stream_id: &str,
    stream: &Arc<Stream>,
    idle_timeout: Duration,
) {
    let registry = registry.clone();
    let outbound = outbound.clone();
    let stream_id = stream_id.to_string();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(idle_timeout).await;
        if registry.contains(&stream_id) {
            outbound.emit(WireFrame::error(
                stream_id.clone(),
                &crate::error::TunnelError::IdleExpired,
            ));
            finish(&bridge, &registry, &stream_id);
        }
    });
    stream.arm_idle_timer(handle);
}

fn finish(bridge: &Arc<WsBridge>, registry: &Arc<StreamRegistry>, stream_id: &str) {
    bridge.cleanup(stream_id);
    registry.remove(stream_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_frame_carries_code_and_reason() {
        let frame = close_frame(Some(1000), Some("bye".to_string())).unwrap();
        assert_eq!(u16::from(frame.code), 1000);
        assert_eq!(frame.reason, "bye");
    }

    #[test]
    fn close_frame_is_none_without_a_code() {
        assert!(close_frame(None, Some("bye".to_string())).is_none());
    }
}
