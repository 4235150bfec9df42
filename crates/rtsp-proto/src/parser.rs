use bytes::Bytes;

use crate::error::{Error, Result};
use crate::headers::HeaderList;
use crate::method::Method;
use crate::request::{Request, Version};

/// The result of attempting to parse one request out of a byte buffer.
pub struct Parsed {
    pub request: Request,
    /// Number of bytes consumed from the front of the input buffer.
    pub consumed: usize,
}

/// Parse a single RTSP request from `buf`.
///
/// Returns [`Error::Incomplete`] if the buffer does not yet contain a full
/// request (header block not yet terminated by CRLFCRLF, or body not yet
/// fully buffered per `Content-Length`). The caller (the RTSP Session state
/// machine) is expected to keep reading and re-call this with a larger
/// buffer; it must never re-parse bytes already consumed by a prior call.
pub fn parse_request(buf: &[u8], max_request_size: usize) -> Result<Parsed> {
    if buf.len() > max_request_size {
        // Even the head of the request is too big to ever complete inside
        // the configured ceiling - no point waiting for more bytes.
        if find_header_end(buf).is_none() {
            return Err(Error::RequestTooLarge(max_request_size));
        }
    }

    let header_end = match find_header_end(buf) {
        Some(idx) => idx,
        None => return Err(Error::Incomplete),
    };

    let head = &buf[..header_end];
    let head_str =
        std::str::from_utf8(head).map_err(|_| Error::MalformedRequestLine("non-utf8".into()))?;

    let mut lines = head_str.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let (method, uri, version) = parse_request_line(request_line)?;

    let mut headers = HeaderList::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::MalformedHeader(line.to_string()))?;
        headers.push(name.trim().to_string(), value.trim().to_string());
    }

    if method == Method::Describe && headers.contains(crate::headers::names::SESSION) {
        return Err(Error::SessionHeaderNotAllowed);
    }

    let content_length = match headers.get(crate::headers::names::CONTENT_LENGTH) {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::InvalidContentLength(v.to_string()))?,
        None => 0,
    };

    let body_start = header_end + 4; // skip the CRLFCRLF
    let total_len = body_start + content_length;
    if buf.len() < total_len {
        return Err(Error::Incomplete);
    }
    if total_len > max_request_size {
        return Err(Error::RequestTooLarge(max_request_size));
    }

    let body = Bytes::copy_from_slice(&buf[body_start..total_len]);

    Ok(Parsed {
        request: Request {
            method,
            uri,
            version,
            headers,
            body,
        },
        consumed: total_len,
    })
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let mut parts = line.split(' ');
    let method = parts
        .next()
        .ok_or_else(|| Error::MalformedRequestLine(line.to_string()))?;
    let uri = parts
        .next()
        .ok_or_else(|| Error::MalformedRequestLine(line.to_string()))?;
    let version = parts
        .next()
        .ok_or_else(|| Error::MalformedRequestLine(line.to_string()))?;

    let method: Method = method.parse()?;
    let version = parse_version(version)?;

    Ok((method, uri.to_string(), version))
}

fn parse_version(s: &str) -> Result<Version> {
    let rest = s
        .strip_prefix("RTSP/")
        .ok_or_else(|| Error::MalformedRequestLine(s.to_string()))?;
    let (major, minor) = rest
        .split_once('.')
        .ok_or_else(|| Error::MalformedRequestLine(s.to_string()))?;
    let major = major
        .parse()
        .map_err(|_| Error::MalformedRequestLine(s.to_string()))?;
    let minor = minor
        .parse()
        .map_err(|_| Error::MalformedRequestLine(s.to_string()))?;
    Ok(Version { major, minor })
}

/// Find the index of the CRLFCRLF that ends the header block, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONS_REQ: &[u8] = b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n";

    #[test]
    fn parses_options_request() {
        let parsed = parse_request(OPTIONS_REQ, 4096).unwrap();
        assert_eq!(parsed.request.method, Method::Options);
        assert_eq!(parsed.request.uri, "*");
        assert_eq!(parsed.request.cseq(), Some("1"));
        assert_eq!(parsed.consumed, OPTIONS_REQ.len());
    }

    #[test]
    fn incomplete_without_trailing_crlfcrlf() {
        let buf = b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n";
        assert_eq!(parse_request(buf, 4096), Err(Error::Incomplete));
    }

    #[test]
    fn incomplete_while_body_still_arriving() {
        let buf = b"ANNOUNCE rtsp://h/m RTSP/1.0\r\nCSeq: 2\r\nContent-Length: 10\r\n\r\nabc";
        assert_eq!(parse_request(buf, 4096), Err(Error::Incomplete));
    }

    #[test]
    fn describe_with_session_header_is_rejected() {
        let buf = b"DESCRIBE rtsp://h/m.mov RTSP/1.0\r\nCSeq: 2\r\nSession: 1234\r\n\r\n";
        assert_eq!(
            parse_request(buf, 4096),
            Err(Error::SessionHeaderNotAllowed)
        );
    }

    #[test]
    fn request_over_max_size_is_rejected() {
        let buf = b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        assert_eq!(
            parse_request(buf, 4),
            Err(Error::RequestTooLarge(4))
        );
    }

    #[test]
    fn round_trip_parse_reemit_reparse() {
        let parsed = parse_request(OPTIONS_REQ, 4096).unwrap();
        let bytes = parsed.request.to_bytes();
        let reparsed = parse_request(&bytes, 4096).unwrap();
        assert_eq!(parsed.request.method, reparsed.request.method);
        assert_eq!(parsed.request.uri, reparsed.request.uri);
        assert_eq!(parsed.request.cseq(), reparsed.request.cseq());
    }
}
