use thiserror::Error;

use crate::response::StatusCode;

/// A type alias for handling `Result`s with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing or rendering RTSP wire data.
///
/// These map directly onto the request-level error taxonomy in the core
/// specification: anything here becomes a `400`/`414` response rather than
/// a connection teardown, except [`Error::Incomplete`] which means "keep
/// reading, no error yet".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Not enough bytes buffered yet to parse a full request or frame.
    #[error("incomplete message")]
    Incomplete,

    /// The request line could not be parsed.
    #[error("malformed request line: {0}")]
    MalformedRequestLine(String),

    /// An unsupported or unrecognized method.
    #[error("invalid RTSP method: {0}")]
    InvalidMethod(String),

    /// A header line had no `:` separator or an empty name.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// `Content-Length` did not parse as an integer.
    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),

    /// The buffered request exceeds the configured maximum size.
    #[error("request exceeds maximum size of {0} bytes")]
    RequestTooLarge(usize),

    /// Base64 payload (HTTP tunnel body) failed to decode.
    #[error("invalid base64 payload")]
    InvalidBase64,

    /// Interleaved frame ('$') header was malformed.
    #[error("malformed interleaved frame header")]
    MalformedInterleavedFrame,

    /// A `DESCRIBE` carried a `Session:` header, which is disallowed.
    #[error("Session header not allowed on this method")]
    SessionHeaderNotAllowed,
}

impl Error {
    /// The RTSP status this parse failure maps onto (spec §7,
    /// Request-level), or `None` if the connection must simply be dropped
    /// rather than answered (framing corruption on an interleaved TCP
    /// connection, or "not yet enough bytes").
    pub fn request_level_status(&self) -> Option<StatusCode> {
        match self {
            Error::Incomplete | Error::MalformedInterleavedFrame => None,
            Error::RequestTooLarge(_) => Some(StatusCode::REQUEST_URI_TOO_LARGE),
            Error::SessionHeaderNotAllowed => Some(StatusCode::METHOD_NOT_VALID_IN_STATE),
            Error::MalformedRequestLine(_)
            | Error::InvalidMethod(_)
            | Error::MalformedHeader(_)
            | Error::InvalidContentLength(_)
            | Error::InvalidBase64 => Some(StatusCode::BAD_REQUEST),
        }
    }
}
