use thiserror::Error;

/// The tunnel core's single error type. Every fallible internal operation returns
/// `Result<T, TunnelError>`; only [`crate::handler::TunnelHandler`] converts a value of
/// this type into an outbound ERROR frame or a log line, per the error taxonomy.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown stream {0}")]
    UnknownStream(String),

    #[error("port {0} is not permitted")]
    PolicyDenied(u16),

    #[error("concurrent stream limit reached")]
    AdmissionDenied,

    #[error("upstream connect/transport failure: {0}")]
    UpstreamFailure(String),

    #[error("upstream timed out")]
    UpstreamTimeout,

    #[error("response exceeded max_response_size ({0} bytes)")]
    SizeCapExceeded(u64),

    #[error("stream deadline expired")]
    DeadlineExpired,

    #[error("stream idle timeout expired")]
    IdleExpired,

    #[error("url rewrite failed: {0}")]
    RewriteFailed(String),

    #[error("tunnel handler is shutting down")]
    HandlerShutdown,
}

impl TunnelError {
    /// The ERROR frame's `status_code`, per spec §7.
    pub fn status_code(&self) -> u16 {
        match self {
            TunnelError::MalformedFrame(_) => 400,
            TunnelError::UnknownStream(_) => 400,
            TunnelError::PolicyDenied(_) => 403,
            TunnelError::AdmissionDenied => 503,
            TunnelError::UpstreamFailure(_) => 502,
            TunnelError::UpstreamTimeout => 504,
            TunnelError::SizeCapExceeded(_) => 413,
            TunnelError::DeadlineExpired => 504,
            TunnelError::IdleExpired => 504,
            TunnelError::RewriteFailed(_) => 500,
            TunnelError::HandlerShutdown => 500,
        }
    }

    /// Whether this error kind should ever reach the remote as an ERROR frame at all.
    /// Malformed frames, unknown streams, and rewrite failures are logged-and-dropped /
    /// logged-and-passthrough per §7 and never produce an ERROR frame of their own.
    pub fn is_frame_terminal(&self) -> bool {
        !matches!(
            self,
            TunnelError::MalformedFrame(_)
                | TunnelError::UnknownStream(_)
                | TunnelError::RewriteFailed(_)
        )
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
