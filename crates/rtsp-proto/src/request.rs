use bytes::Bytes;

use crate::headers::HeaderList;
use crate::method::Method;

/// A fully parsed RTSP request line plus headers. The body (if any) is
/// carried separately since it may still be streaming in when the headers
/// are already usable by the role pipeline.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// The raw request-URI, unmodified until a `Route` module rewrites it.
    pub uri: String,
    pub version: Version,
    pub headers: HeaderList,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const RTSP_1_0: Version = Version { major: 1, minor: 0 };
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RTSP/{}.{}", self.major, self.minor)
    }
}

impl Request {
    pub fn cseq(&self) -> Option<&str> {
        self.headers.get(crate::headers::names::CSEQ)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.headers.get(crate::headers::names::SESSION)
    }

    /// Render the request back to wire bytes, for logging or for the
    /// parse/re-emit/reparse round-trip law in spec §8.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = format!("{} {} {}\r\n", self.method, self.uri, self.version);
        out.push_str(&self.headers.to_string());
        out.push_str("\r\n");
        let mut buf = out.into_bytes();
        buf.extend_from_slice(&self.body);
        Bytes::from(buf)
    }
}
