use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy from spec §7, unified across the session state
/// machine and role dispatch. Role dispatchers convert a failure into a
/// prebuilt error response (spec §9) rather than unwinding; only
/// [`Error::TransportFatal`] ever reaches the point of killing the task.
#[derive(Error, Debug)]
pub enum Error {
    /// Peer closed, a socket error other than would-block, or malformed
    /// interleaved framing: terminate the session.
    #[error("transport fatal: {0}")]
    TransportFatal(String),

    /// Malformed RTSP syntax, a missing required header, an over-length
    /// request, or bad tunnel base64. Answered with `400`/`414`.
    #[error("request-level error: {0}")]
    RequestLevel(#[from] rtsp_proto::Error),

    /// Scheme mismatch, wrong credentials, or module denial. Answered with
    /// `401` (fresh challenge) or `403`.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Over max-connections or over max-bandwidth. Answered with `453` or
    /// `503` and the connection is closed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Zero listeners bound, no IP interfaces, cannot drop privileges.
    /// Logged and the process exits with the fatal exit code.
    #[error("startup fatal: {0}")]
    StartupFatal(String),

    #[error(transparent)]
    Rtp(#[from] rtp_session::Error),

    #[error(transparent)]
    Transport(#[from] rtsp_transport::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error must terminate the TCP connection outright
    /// rather than be convertible to an RTSP error response (spec §7).
    pub fn is_transport_fatal(&self) -> bool {
        matches!(self, Error::TransportFatal(_))
    }
}
