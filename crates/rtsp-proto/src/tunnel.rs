//! HTTP 1.0 tunnel framing (spec §4.6, §6): a GET carrying
//! `X-Sessioncookie` and `Accept: application/x-rtsp-tunnelled` pairs with a
//! POST of the same cookie that carries base64-encoded RTSP as its body.

use base64::Engine;
use bytes::Bytes;

use crate::error::{Error, Result};
use crate::headers::HeaderList;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct HttpTunnelRequest {
    pub method: HttpMethod,
    pub path: String,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl HttpTunnelRequest {
    pub fn cookie(&self) -> Option<&str> {
        self.headers.get(crate::headers::names::X_SESSIONCOOKIE)
    }

    /// `true` if this GET is asking to open an RTSP tunnel per spec §4.6.
    pub fn is_tunnel_get(&self) -> bool {
        self.method == HttpMethod::Get
            && self.cookie().is_some()
            && self
                .headers
                .get(crate::headers::names::ACCEPT)
                .map(|a| a.eq_ignore_ascii_case("application/x-rtsp-tunnelled"))
                .unwrap_or(false)
    }

    /// Decode the POST body (base64-encoded RTSP) back into raw RTSP bytes.
    pub fn decode_rtsp_body(&self) -> Result<Bytes> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.body[..])
            .map(Bytes::from)
            .map_err(|_| Error::InvalidBase64)
    }
}

/// Parse an HTTP/1.0 request line + headers (no body length inference
/// beyond `Content-Length`, matching the RTSP parser's convention).
pub fn parse_http_request(buf: &[u8], max_request_size: usize) -> Result<(HttpTunnelRequest, usize)> {
    if buf.len() > max_request_size && !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        return Err(Error::RequestTooLarge(max_request_size));
    }

    let header_end = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or(Error::Incomplete)?;

    let head = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| Error::MalformedRequestLine("non-utf8".into()))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split(' ');
    let method = parts
        .next()
        .ok_or_else(|| Error::MalformedRequestLine(request_line.to_string()))?;
    let path = parts
        .next()
        .ok_or_else(|| Error::MalformedRequestLine(request_line.to_string()))?
        .to_string();

    let method = match method {
        "GET" => HttpMethod::Get,
        "POST" => HttpMethod::Post,
        other => return Err(Error::MalformedRequestLine(other.to_string())),
    };

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

    let content_length: usize = headers
        .get(crate::headers::names::CONTENT_LENGTH)
        .map(|v| v.trim().parse())
        .transpose()
        .map_err(|_| Error::InvalidContentLength("Content-Length".into()))?
        .unwrap_or(0);

    let body_start = header_end + 4;
    let total_len = body_start + content_length;
    if buf.len() < total_len {
        return Err(Error::Incomplete);
    }

    let body = Bytes::copy_from_slice(&buf[body_start..total_len]);

    Ok((
        HttpTunnelRequest {
            method,
            path,
            headers,
            body,
        },
        total_len,
    ))
}

/// The fixed 200-OK response the GET half of a tunnel receives immediately
/// (spec §4.6, §6): headers only, connection stays open indefinitely to
/// carry downstream RTSP responses and interleaved data.
pub fn tunnel_ok_response() -> Bytes {
    Bytes::from_static(
        b"HTTP/1.0 200 OK\r\n\
          Content-Type: application/x-rtsp-tunnelled\r\n\
          Connection: close\r\n\
          Cache-Control: no-cache\r\n\
          Pragma: no-cache\r\n\
          \r\n",
    )
}

/// Incrementally decodes a continuous base64 stream (the POST half of a
/// tunnel keeps its body open indefinitely and streams more encoded RTSP
/// as it becomes available, rather than sending one padded blob per
/// request). Complete 4-character groups are decoded as they arrive;
/// anything left over is held until the next [`feed`](Self::feed) call.
#[derive(Default)]
pub struct IncrementalBase64Decoder {
    pending: Vec<u8>,
}

impl IncrementalBase64Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes read off the wire; returns whatever decoded RTSP
    /// bytes are now available (possibly empty).
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Bytes> {
        self.pending.extend_from_slice(chunk);
        let ready_len = (self.pending.len() / 4) * 4;
        if ready_len == 0 {
            return Ok(Bytes::new());
        }
        let ready: Vec<u8> = self.pending.drain(..ready_len).collect();
        base64::engine::general_purpose::STANDARD
            .decode(&ready)
            .map(Bytes::from)
            .map_err(|_| Error::InvalidBase64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_tunnel_get() {
        let buf = b"GET /x HTTP/1.0\r\nX-Sessioncookie: c0\r\nAccept: application/x-rtsp-tunnelled\r\n\r\n";
        let (req, consumed) = parse_http_request(buf, 4096).unwrap();
        assert_eq!(consumed, buf.len());
        assert!(req.is_tunnel_get());
        assert_eq!(req.cookie(), Some("c0"));
    }

    #[test]
    fn post_body_round_trips_base64() {
        let rtsp = b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(rtsp);
        let raw = format!(
            "POST /x HTTP/1.0\r\nX-Sessioncookie: c0\r\nContent-Length: {}\r\n\r\n{}",
            encoded.len(),
            encoded
        );
        let (req, _) = parse_http_request(raw.as_bytes(), 4096).unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        let decoded = req.decode_rtsp_body().unwrap();
        assert_eq!(&decoded[..], rtsp);
    }

    #[test]
    fn incremental_decoder_handles_split_chunks() {
        let rtsp = b"OPTIONS * RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(rtsp);
        let mid = encoded.len() / 2;

        let mut decoder = IncrementalBase64Decoder::new();
        let mut out = decoder.feed(encoded[..mid].as_bytes()).unwrap().to_vec();
        out.extend_from_slice(&decoder.feed(encoded[mid..].as_bytes()).unwrap());
        assert_eq!(out, rtsp);
    }
}
