//! Wire-level RTSP 1.0 (RFC 2326) message types, a streaming parser, the
//! RFC 2326 §10.12 interleaved-frame codec, the HTTP 1.0 tunnel framing,
//! and Basic/Digest auth primitives.
//!
//! This crate owns no sockets and spawns no tasks; [`rtsp-transport`] and
//! [`session-core`] build on top of it.

pub mod auth;
pub mod error;
pub mod headers;
pub mod interleaved;
pub mod method;
pub mod parser;
pub mod request;
pub mod response;
pub mod tunnel;

pub use error::{Error, Result};
pub use headers::{Header, HeaderList};
pub use method::Method;
pub use request::{Request, Version};
pub use response::{Response, StatusCode};
pub use tunnel::IncrementalBase64Decoder;
