use bytes::Bytes;

use crate::headers::HeaderList;
use crate::request::Version;

/// RTSP status codes the core itself ever writes (spec §7, §8). Modules may
/// produce others; this enum only names the ones the core constructs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusCode(pub u16);

impl StatusCode {
    pub const OK: StatusCode = StatusCode(200);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const SESSION_NOT_FOUND: StatusCode = StatusCode(454);
    pub const METHOD_NOT_VALID_IN_STATE: StatusCode = StatusCode(455);
    pub const REQUEST_URI_TOO_LARGE: StatusCode = StatusCode(414);
    pub const NOT_ENOUGH_BANDWIDTH: StatusCode = StatusCode(453);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const OPTION_NOT_SUPPORTED: StatusCode = StatusCode(551);

    pub fn reason(&self) -> &'static str {
        match self.0 {
            200 => "OK",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            414 => "Request-URI Too Large",
            453 => "Not Enough Bandwidth",
            454 => "Session Not Found",
            455 => "Method Not Valid in This State",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            551 => "Option not supported",
            _ => "Unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: StatusCode,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::RTSP_1_0,
            status,
            headers: HeaderList::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_cseq(mut self, cseq: Option<&str>) -> Self {
        if let Some(cseq) = cseq {
            self.headers.set(crate::headers::names::CSEQ, cseq);
        }
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.headers
            .set(crate::headers::names::CONTENT_LENGTH, body.len().to_string());
        self.headers.set(crate::headers::names::CONTENT_TYPE, content_type);
        self.body = body;
        self
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = format!(
            "{} {} {}\r\n",
            self.version,
            self.status.0,
            self.status.reason()
        );
        out.push_str(&self.headers.to_string());
        out.push_str("\r\n");
        let mut buf = out.into_bytes();
        buf.extend_from_slice(&self.body);
        Bytes::from(buf)
    }
}
