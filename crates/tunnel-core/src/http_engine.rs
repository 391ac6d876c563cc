//! HTTP Proxy Engine (C6).
//!
//! Drives one upstream HTTP/1.1 request per stream, fed incrementally by inbound
//! `DATA`/`END` frames, and streams the upstream response back out chunk by chunk
//! through C2 (headers) and C4 (rewriting), enforcing `max_response_size` and the
//! idle/deadline timers along the way.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Request, Uri};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame as HyperFrame;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::config::TunnelConfig;
use crate::frame::{Frame as WireFrame, StreamId};
use crate::headers;
use crate::outbound::OutboundSender;
use crate::policy::PortPolicy;
use crate::registry::{Stream, StreamRegistry, UpstreamKind};
use crate::rewrite;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, std::io::Error>;

/// Events forwarded from the dispatch loop to a stream's upstream-driving task.
enum InboundEvent {
    Data(Bytes),
    End,
}

/// Drives HTTP streams. Holds the shared hyper client plus a side table routing
/// inbound `DATA`/`END` frames to the task currently writing each stream's upstream
/// request body.
pub struct HttpEngine {
    client: Client<HttpConnector, BoxBody>,
    inbound: DashMap<StreamId, mpsc::UnboundedSender<InboundEvent>>,
}

impl HttpEngine {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(5)));
        let client: Client<HttpConnector, BoxBody> =
            Client::builder(TokioExecutor::new()).build(connector);
        HttpEngine {
            client,
            inbound: DashMap::new(),
        }
    }

    /// Handles an inbound `TUNNEL_REQUEST` frame (§4.6 steps 1-7).
    #[allow(clippy::too_many_arguments)]
    pub fn handle_request(
        self: &Arc<Self>,
        registry: &Arc<StreamRegistry>,
        outbound: &OutboundSender,
        config: &Arc<TunnelConfig>,
        policy: &Arc<PortPolicy>,
        stream_id: StreamId,
        port: u16,
        method: String,
        path: String,
        raw_headers: HashMap<String, String>,
        scheme: Option<String>,
        worker_id: Option<String>,
        deadline_ms: Option<u64>,
    ) {
        if !policy.is_allowed(port) {
            outbound.emit(WireFrame::error(
                stream_id,
                &crate::error::TunnelError::PolicyDenied(port),
            ));
            return;
        }

        let local_port = policy.resolve_local(port);
        let scheme = scheme.unwrap_or_else(|| "http".to_string());
        let worker_id = worker_id.or_else(|| config.worker_id.clone());

        let stream = Arc::new(Stream::new(
            stream_id.clone(),
            worker_id,
            port,
            local_port,
            scheme,
            method.clone(),
            path.clone(),
        ));
        stream.set_upstream_kind(UpstreamKind::HttpRequestInFlight);

        if let Err(err) = registry.insert(stream.clone()) {
            outbound.emit(WireFrame::error(stream_id, &err));
            return;
        }

        let headers = headers::normalize_inbound(&raw_headers, config.force_identity_encoding);

        // Unbounded so that `handle_data`/`handle_end`, called directly from the
        // single control-link dispatch loop, never suspend on a slow or stalled
        // local upstream (§5: upstream write suspension "must not block the
        // dispatcher from servicing unrelated streams"). The `forwarder` task below
        // is the one that blocks on the upstream body channel; it runs off the
        // dispatch path entirely.
        let (body_tx, body_rx) = mpsc::unbounded_channel::<InboundEvent>();
        self.inbound.insert(stream_id.clone(), body_tx);

        if let Some(ms) = deadline_ms.filter(|ms| *ms > 0) {
            let registry = registry.clone();
            let outbound = outbound.clone();
            let engine = self.clone();
            let stream_id_for_timer = stream_id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                if registry.contains(&stream_id_for_timer) {
                    outbound.emit(WireFrame::error(
                        stream_id_for_timer.clone(),
                        &crate::error::TunnelError::DeadlineExpired,
                    ));
                    engine.cleanup(&stream_id_for_timer);
                    registry.remove(&stream_id_for_timer);
                }
            });
            stream.arm_deadline_timer(handle);
        }

        engine_spawn_drive_task(
            self.clone(),
            registry.clone(),
            outbound.clone(),
            config.clone(),
            policy.clone(),
            stream,
            method,
            path,
            headers,
            body_rx,
        );
    }

    /// Routes an inbound `DATA` frame to the stream's body-writing task, then rearms
    /// the idle timer: §4.6 rearms on every DATA event in either direction, not just
    /// outbound response chunks. Unknown stream ids are logged and dropped per §7
    /// kind 2. Synchronous and non-suspending by construction (`UnboundedSender::send`
    /// never awaits), so a stalled local upstream on one stream can never hold up the
    /// single control-link dispatch loop that calls this for every stream.
    pub fn handle_data(
        self: &Arc<Self>,
        registry: &Arc<StreamRegistry>,
        outbound: &OutboundSender,
        idle_timeout: Duration,
        stream_id: &str,
        bytes: Vec<u8>,
    ) {
        let sender = self.inbound.get(stream_id).map(|e| e.clone());
        match sender {
            Some(tx) => {
                if tx.send(InboundEvent::Data(Bytes::from(bytes))).is_err() {
                    tracing::warn!(stream_id, "stream body channel closed, dropping data");
                } else if let Some(stream) = registry.get(stream_id) {
                    rearm_idle_timer(self.clone(), registry, outbound, stream_id, &stream, idle_timeout);
                }
            }
            None => tracing::warn!(stream_id, "data frame for unknown http stream, dropping"),
        }
    }

    /// Half-closes the upstream request body for `stream_id`. Synchronous for the
    /// same reason as `handle_data`.
    pub fn handle_end(&self, stream_id: &str) {
        if let Some(tx) = self.inbound.get(stream_id).map(|e| e.clone()) {
            let _ = tx.send(InboundEvent::End);
        }
    }

    /// Drops the routing entry for `stream_id`. Safe to call on an absent id.
    pub fn cleanup(&self, stream_id: &str) {
        self.inbound.remove(stream_id);
    }
}

impl Default for HttpEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::too_many_arguments)]
fn engine_spawn_drive_task(
    engine: Arc<HttpEngine>,
    registry: Arc<StreamRegistry>,
    outbound: OutboundSender,
    config: Arc<TunnelConfig>,
    policy: Arc<PortPolicy>,
    stream: Arc<Stream>,
    method: String,
    path: String,
    headers: HeaderMap,
    body_rx: mpsc::UnboundedReceiver<InboundEvent>,
) {
    let bind_target = stream.clone();
    let handle = tokio::spawn(async move {
        drive_http_stream(
            engine, registry, outbound, config, policy, stream, method, path, headers, body_rx,
        )
        .await;
    });
    // Bound on the stream so that a timer-triggered `registry.remove` (deadline or
    // idle expiry) actually stops this task via `cancel_upstream_task`, rather than
    // merely dropping the registry entry out from under a task that keeps running.
    bind_target.bind_upstream_task(handle);
}

#[allow(clippy::too_many_arguments)]
async fn drive_http_stream(
    engine: Arc<HttpEngine>,
    registry: Arc<StreamRegistry>,
    outbound: OutboundSender,
    config: Arc<TunnelConfig>,
    policy: Arc<PortPolicy>,
    stream: Arc<Stream>,
    method: String,
    path: String,
    headers: HeaderMap,
    mut inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
) {
    let stream_id = stream.stream_id.clone();

    let (upstream_tx, upstream_rx) = mpsc::channel::<Bytes>(16);
    let forwarder_stream = stream.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = inbound_rx.recv().await {
            match event {
                InboundEvent::Data(bytes) => {
                    forwarder_stream.add_bytes_in(bytes.len() as u64);
                    forwarder_stream.set_paused(true);
                    if upstream_tx.send(bytes).await.is_err() {
                        break;
                    }
                    forwarder_stream.set_paused(false);
                }
                InboundEvent::End => break,
            }
        }
    });

    let body_stream = ReceiverStream::new(upstream_rx)
        .map(|chunk| Ok::<_, Infallible>(HyperFrame::data(chunk)));
    let body: BoxBody = StreamBody::new(body_stream)
        .map_err(|never: Infallible| match never {})
        .boxed();

    let uri: Uri = match format!("http://{}:{}{}", config.local_host, stream.local_port, path).parse() {
        Ok(uri) => uri,
        Err(e) => {
            outbound.emit(WireFrame::error(
                stream_id.clone(),
                &crate::error::TunnelError::UpstreamFailure(e.to_string()),
            ));
            finish(&engine, &registry, &stream_id, forwarder);
            return;
        }
    };

    let mut builder = Request::builder().method(method.as_str()).uri(uri);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    let request = match builder.body(body) {
        Ok(req) => req,
        Err(e) => {
            outbound.emit(WireFrame::error(
                stream_id.clone(),
                &crate::error::TunnelError::UpstreamFailure(e.to_string()),
            ));
            finish(&engine, &registry, &stream_id, forwarder);
            return;
        }
    };

    let response = match tokio::time::timeout(config.connect_timeout, engine.client.request(request)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            outbound.emit(WireFrame::error(
                stream_id.clone(),
                &crate::error::TunnelError::UpstreamFailure(e.to_string()),
            ));
            finish(&engine, &registry, &stream_id, forwarder);
            return;
        }
        Err(_) => {
            outbound.emit(WireFrame::error(
                stream_id.clone(),
                &crate::error::TunnelError::UpstreamTimeout,
            ));
            finish(&engine, &registry, &stream_id, forwarder);
            return;
        }
    };

    stream.set_upstream_kind(UpstreamKind::HttpResponseStreaming);

    let status = response.status();
    let mut response_headers = response.headers().clone();

    let content_type = response_headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let use_https = stream.scheme == "https";
    let rewriting_applies = config.rewriting_enabled() && rewrite::is_rewritable_content_type(&content_type);
    if rewriting_applies {
        response_headers.remove(http::header::CONTENT_LENGTH);
    }

    outbound.emit(WireFrame::Response {
        stream_id: stream_id.clone(),
        status_code: status.as_u16(),
        headers: headers::to_wire_map(&response_headers),
        status_message: status.canonical_reason().map(|s| s.to_string()),
    });

    let mut incoming = response.into_body();
    loop {
        match incoming.frame().await {
            Some(Ok(frame)) => {
                let Ok(chunk) = frame.into_data() else {
                    // Trailers are stripped per C2; nothing to forward.
                    continue;
                };
                let out_chunk = if rewriting_applies {
                    rewrite::rewrite_chunk(
                        &chunk,
                        &content_type,
                        stream.worker_id.as_deref(),
                        &config.tunnel_domain,
                        use_https,
                        &policy,
                    )
                } else {
                    chunk.to_vec()
                };

                let total = stream.add_bytes_out(out_chunk.len() as u64);
                if total > config.max_response_size {
                    outbound.emit(WireFrame::error(
                        stream_id.clone(),
                        &crate::error::TunnelError::SizeCapExceeded(config.max_response_size),
                    ));
                    break;
                }

                outbound.emit(WireFrame::data(stream_id.clone(), out_chunk));
                rearm_idle_timer(engine.clone(), &registry, &outbound, &stream_id, &stream, config.idle_timeout);
            }
            Some(Err(e)) => {
                outbound.emit(WireFrame::error(
                    stream_id.clone(),
                    &crate::error::TunnelError::UpstreamFailure(e.to_string()),
                ));
                break;
            }
            None => {
                outbound.emit(WireFrame::end(stream_id.clone()));
                break;
            }
        }
    }

    finish(&engine, &registry, &stream_id, forwarder);
}

fn rearm_idle_timer(
    engine: Arc<HttpEngine>,
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
            // Mirrors the deadline timer above: drop the `self.inbound` routing
            // entry (and thus the `body_tx` sender) before removing the stream from
            // the registry, or the `forwarder` task spawned in `drive_http_stream`
            // is left awaiting `inbound_rx.recv()` forever with nothing left to
            // abort it.
            engine.cleanup(&stream_id);
            registry.remove(&stream_id);
        }
    });
    stream.arm_idle_timer(handle);
}

fn finish(
    engine: &Arc<HttpEngine>,
    registry: &Arc<StreamRegistry>,
    stream_id: &str,
    forwarder: tokio::task::JoinHandle<()>,
) {
    forwarder.abort();
    engine.cleanup(stream_id);
    registry.remove(stream_id);
}
