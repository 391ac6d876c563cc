//! Stream Registry (C5).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::error::{TunnelError, TunnelResult};
use crate::frame::StreamId;

/// Which upstream kind, if any, currently owns a stream. Enforces invariant #2: at
/// most one upstream handle is bound to a `Stream` at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    None,
    HttpRequestInFlight,
    HttpResponseStreaming,
    WsOpen,
}

/// Per-stream mutable state: counters, pause flag, cancelable timers, and the task
/// driving the bound upstream connection.
pub struct Stream {
    pub stream_id: StreamId,
    pub worker_id: Option<String>,
    pub remote_port: u16,
    pub local_port: u16,
    pub scheme: String,
    pub method: String,
    pub path: String,
    pub start_time: Instant,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    paused: AtomicBool,
    upstream_kind: Mutex<UpstreamKind>,
    upstream_task: Mutex<Option<JoinHandle<()>>>,
    deadline_timer: Mutex<Option<JoinHandle<()>>>,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
}

impl Stream {
    pub fn new(
        stream_id: StreamId,
        worker_id: Option<String>,
        remote_port: u16,
        local_port: u16,
        scheme: String,
        method: String,
        path: String,
    ) -> Self {
        Stream {
            stream_id,
            worker_id,
            remote_port,
            local_port,
            scheme,
            method,
            path,
            start_time: Instant::now(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            paused: AtomicBool::new(false),
            upstream_kind: Mutex::new(UpstreamKind::None),
            upstream_task: Mutex::new(None),
            deadline_timer: Mutex::new(None),
            idle_timer: Mutex::new(None),
        }
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::SeqCst)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::SeqCst)
    }

    pub fn add_bytes_in(&self, n: u64) -> u64 {
        self.bytes_in.fetch_add(n, Ordering::SeqCst) + n
    }

    /// Adds to `bytes_out` and returns the new total, so callers can compare against
    /// `max_response_size` without a separate load racing the add.
    pub fn add_bytes_out(&self, n: u64) -> u64 {
        self.bytes_out.fetch_add(n, Ordering::SeqCst) + n
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn upstream_kind(&self) -> UpstreamKind {
        *self.upstream_kind.lock()
    }

    pub fn set_upstream_kind(&self, kind: UpstreamKind) {
        *self.upstream_kind.lock() = kind;
    }

    /// Binds the task driving this stream's upstream connection, replacing (and
    /// aborting) any previous one.
    pub fn bind_upstream_task(&self, handle: JoinHandle<()>) {
        let previous = self.upstream_task.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Aborts the upstream task, if any. Destroys the underlying connection so its
    /// file descriptor is released rather than leaked on client disconnect.
    pub fn cancel_upstream_task(&self) {
        if let Some(handle) = self.upstream_task.lock().take() {
            handle.abort();
        }
    }

    pub fn arm_deadline_timer(&self, handle: JoinHandle<()>) {
        let previous = self.deadline_timer.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn cancel_deadline_timer(&self) {
        if let Some(handle) = self.deadline_timer.lock().take() {
            handle.abort();
        }
    }

    /// Rearms the idle timer, canceling whatever was previously scheduled. Called on
    /// every DATA/WS_DATA event in either direction.
    pub fn arm_idle_timer(&self, handle: JoinHandle<()>) {
        let previous = self.idle_timer.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn cancel_idle_timer(&self) {
        if let Some(handle) = self.idle_timer.lock().take() {
            handle.abort();
        }
    }

    pub fn cancel_all_timers(&self) {
        self.cancel_deadline_timer();
        self.cancel_idle_timer();
    }
}

/// In-memory `stream_id -> Stream` map with an admission cap. Mutated only from the
/// dispatch path and from cleanup, per §5's shared-resource policy, so a plain
/// length-then-insert is race-free in practice despite not being a single atomic op.
pub struct StreamRegistry {
    streams: DashMap<StreamId, Arc<Stream>>,
    max_concurrent_streams: usize,
}

impl StreamRegistry {
    pub fn new(max_concurrent_streams: usize) -> Self {
        StreamRegistry {
            streams: DashMap::new(),
            max_concurrent_streams,
        }
    }

    /// Inserts `stream` if the registry is under `max_concurrent_streams`. Leaves the
    /// registry untouched and returns `AdmissionDenied` otherwise.
    pub fn insert(&self, stream: Arc<Stream>) -> TunnelResult<()> {
        if self.streams.len() >= self.max_concurrent_streams {
            return Err(TunnelError::AdmissionDenied);
        }
        self.streams.insert(stream.stream_id.clone(), stream);
        Ok(())
    }

    pub fn get(&self, stream_id: &str) -> Option<Arc<Stream>> {
        self.streams.get(stream_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.streams.contains_key(stream_id)
    }

    /// Cancels both timers and the upstream task, then drops the entry. Idempotent:
    /// removing an absent id does nothing.
    pub fn remove(&self, stream_id: &str) {
        if let Some((_, stream)) = self.streams.remove(stream_id) {
            stream.cancel_all_timers();
            stream.cancel_upstream_task();
        }
    }

    pub fn size(&self) -> usize {
        self.streams.len()
    }

    /// Snapshot of every live stream id, used by handler shutdown to clean each one up.
    pub fn iter_for_shutdown(&self) -> Vec<StreamId> {
        self.streams.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(id: &str) -> Arc<Stream> {
        Arc::new(Stream::new(
            id.to_string(),
            None,
            3000,
            3000,
            "http".to_string(),
            "GET".to_string(),
            "/".to_string(),
        ))
    }

    #[test]
    fn admission_cap_is_enforced() {
        let registry = StreamRegistry::new(1);
        registry.insert(stream("s1")).unwrap();
        let err = registry.insert(stream("s2")).unwrap_err();
        assert!(matches!(err, TunnelError::AdmissionDenied));
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn remove_is_idempotent_on_absent_id() {
        let registry = StreamRegistry::new(10);
        registry.remove("does-not-exist");
        registry.insert(stream("s1")).unwrap();
        registry.remove("s1");
        registry.remove("s1");
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn get_returns_none_after_removal() {
        let registry = StreamRegistry::new(10);
        registry.insert(stream("s1")).unwrap();
        assert!(registry.get("s1").is_some());
        registry.remove("s1");
        assert!(registry.get("s1").is_none());
    }

    #[test]
    fn bytes_out_tracks_cumulative_total() {
        let s = stream("s1");
        assert_eq!(s.add_bytes_out(10), 10);
        assert_eq!(s.add_bytes_out(5), 15);
        assert_eq!(s.bytes_out(), 15);
    }

    #[tokio::test]
    async fn canceling_upstream_task_aborts_it() {
        let s = stream("s1");
        let handle = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        });
        s.bind_upstream_task(handle);
        s.cancel_upstream_task();
        // give the runtime a tick to process the abort
        tokio::task::yield_now().await;
    }
}
