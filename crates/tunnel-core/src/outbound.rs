//! The control link's single writer (§5, §9 "single-writer on the control link").
//!
//! Every component emits frames through one `OutboundSender`, cloned freely; the
//! actual serialized write happens on a dedicated task reading a channel, so two
//! concurrent emits can never interleave their bytes on the wire.

use tokio::sync::mpsc;

use crate::frame::Frame;

/// Handle shared by every component that needs to emit a frame. Cloning is cheap
/// (it's a channel sender); dropping every clone closes the link's write side.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<Frame>,
}

impl OutboundSender {
    /// Queues `frame` for the writer task. If the link has already closed, the frame
    /// is dropped with a warning rather than panicking — a late emit racing shutdown
    /// is expected, not exceptional.
    pub fn emit(&self, frame: Frame) {
        let stream_id = frame.stream_id().to_string();
        let kind = frame.kind_name();
        if self.tx.send(frame).is_err() {
            tracing::warn!(stream_id, kind, "control link closed, dropping frame");
        }
    }
}

/// Creates the sender/receiver pair. The receiver is driven by the caller's own
/// writer loop (see `bin/tunneld.rs`'s per-connection write task), which owns the
/// actual transport.
pub fn channel() -> (OutboundSender, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutboundSender { tx }, rx)
}
