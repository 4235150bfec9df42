//! RFC 2326 §10.12 interleaved-data framing: `$<channel:1><len:2><data>`
//! used to carry RTP/RTCP inside the RTSP TCP connection.

use bytes::{Buf, Bytes};

use crate::error::{Error, Result};

pub const MAGIC: u8 = b'$';
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone)]
pub struct InterleavedFrame {
    pub channel: u8,
    pub payload: Bytes,
}

impl InterleavedFrame {
    pub fn encode(channel: u8, payload: &[u8]) -> Bytes {
        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.push(MAGIC);
        buf.push(channel);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);
        Bytes::from(buf)
    }
}

/// Attempt to decode one interleaved frame from the front of `buf`.
/// Returns `Ok(None)` if more bytes are needed; does not consume on that
/// path. The caller is expected to have already checked the first byte is
/// [`MAGIC`] before calling (a session distinguishes "is this an
/// interleaved frame or a new RTSP request?" that way).
pub fn try_decode(buf: &mut Bytes) -> Result<Option<InterleavedFrame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != MAGIC {
        return Err(Error::MalformedInterleavedFrame);
    }
    let channel = buf[1];
    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(len);
    Ok(Some(InterleavedFrame { channel, payload }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_decodes_a_frame() {
        let encoded = InterleavedFrame::encode(0, b"rtp-packet-bytes");
        let mut buf = encoded.clone();
        let frame = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.channel, 0);
        assert_eq!(&frame.payload[..], b"rtp-packet-bytes");
        assert!(buf.is_empty());
    }

    #[test]
    fn reports_incomplete_without_consuming() {
        let encoded = InterleavedFrame::encode(1, b"abcdef");
        let mut partial = encoded.slice(0..5);
        let before_len = partial.len();
        let result = try_decode(&mut partial).unwrap();
        assert!(result.is_none());
        assert_eq!(partial.len(), before_len);
    }
}
