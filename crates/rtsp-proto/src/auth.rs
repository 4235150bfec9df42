//! Basic and Digest (RFC 2617) authentication primitives.
//!
//! The core never sees a cleartext password: an `Authenticate` module hands
//! back a pre-hashed value (the Basic expected password, or
//! `H(user:realm:password)` for Digest) and the functions here compare
//! against what the client supplied, per spec §4.8.

use base64::Engine;
use md5::{Digest, Md5};
use sha2::Sha256;

/// Which digest algorithm a challenge uses. RFC 2617 only defines MD5, but
/// we keep the door open for SHA-256 since later RTSP stacks accept it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

fn hex_hash(algorithm: DigestAlgorithm, input: &str) -> String {
    match algorithm {
        DigestAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            hasher.update(input.as_bytes());
            hex::encode(hasher.finalize())
        }
        DigestAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(input.as_bytes());
            hex::encode(hasher.finalize())
        }
    }
}

/// Minimal hex encoding so we don't pull in an extra crate for six lines.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut s = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            let _ = write!(s, "{:02x}", b);
        }
        s
    }
}

/// Decode a `Basic <base64>` Authorization header value into `user:pass`.
pub fn decode_basic(authorization_value: &str) -> Option<(String, String)> {
    let encoded = authorization_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    decoded.split_once(':').map(|(u, p)| (u.to_string(), p.to_string()))
}

/// Compute the expected hash of a cleartext password the way Basic auth
/// modules are expected to store/compare it (spec §4.8: "possibly
/// one-way-hashed"). Plain equality is also valid; this helper exists for
/// modules that choose to hash.
pub fn hash_basic_password(password: &str) -> String {
    hex_hash(DigestAlgorithm::Md5, password)
}

/// Compute Digest's `H(A1) = H(username:realm:password)`, the value an
/// Authenticate module stores instead of the cleartext password (spec
/// §4.8).
pub fn compute_ha1(algorithm: DigestAlgorithm, username: &str, realm: &str, password: &str) -> String {
    hex_hash(algorithm, &format!("{}:{}:{}", username, realm, password))
}

/// Digest auth parameters parsed out of an `Authorization: Digest ...`
/// header value.
#[derive(Debug, Clone, Default)]
pub struct DigestParams {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub qop: Option<String>,
    pub nc: Option<String>,
    pub cnonce: Option<String>,
    pub opaque: Option<String>,
}

/// Parse the comma-separated `key=value` pairs of a Digest Authorization
/// header (values may be quoted).
pub fn parse_digest_header(value: &str) -> Option<DigestParams> {
    let rest = value.strip_prefix("Digest ")?;
    let mut params = DigestParams::default();

    for part in split_digest_params(rest) {
        let (k, v) = part.split_once('=')?;
        let k = k.trim();
        let v = v.trim().trim_matches('"');
        match k {
            "username" => params.username = v.to_string(),
            "realm" => params.realm = v.to_string(),
            "nonce" => params.nonce = v.to_string(),
            "uri" => params.uri = v.to_string(),
            "response" => params.response = v.to_string(),
            "qop" => params.qop = Some(v.to_string()),
            "nc" => params.nc = Some(v.to_string()),
            "cnonce" => params.cnonce = Some(v.to_string()),
            "opaque" => params.opaque = Some(v.to_string()),
            _ => {}
        }
    }

    Some(params)
}

/// Split on commas that are not inside a quoted string.
fn split_digest_params(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}

/// Compute the RFC 2617 digest response given `H(A1) = H(user:realm:pass)`
/// (as returned by the Authenticate module), the method, and the client's
/// supplied parameters. `qop=auth` and no-qop are both supported per
/// spec §4.8.
pub fn compute_digest_response(
    algorithm: DigestAlgorithm,
    ha1: &str,
    method: &str,
    params: &DigestParams,
) -> String {
    let a2 = format!("{}:{}", method, params.uri);
    let ha2 = hex_hash(algorithm, &a2);

    let input = match (&params.qop, &params.nc, &params.cnonce) {
        (Some(qop), Some(nc), Some(cnonce)) => {
            format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, params.nonce, nc, cnonce, qop, ha2
            )
        }
        _ => format!("{}:{}:{}", ha1, params.nonce, ha2),
    };

    hex_hash(algorithm, &input)
}

/// Build the value of a `WWW-Authenticate: Digest ...` challenge header.
pub fn build_digest_challenge(
    realm: &str,
    nonce: &str,
    opaque: &str,
    qop: Option<&str>,
    stale: bool,
) -> String {
    let mut challenge = format!(
        "Digest realm=\"{}\", nonce=\"{}\", opaque=\"{}\"",
        realm, nonce, opaque
    );
    if let Some(qop) = qop {
        challenge.push_str(&format!(", qop=\"{}\"", qop));
    }
    if stale {
        challenge.push_str(", stale=true");
    }
    challenge
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_basic_header() {
        // "demo:demo" base64-encoded, as used in the spec's worked example.
        let (user, pass) = decode_basic("Basic ZGVtbzpkZW1v").unwrap();
        assert_eq!(user, "demo");
        assert_eq!(pass, "demo");
    }

    #[test]
    fn parses_digest_header_with_qop() {
        let header = r#"Digest username="alice", realm="streaming", nonce="abc123", uri="rtsp://h/m.mov", response="deadbeef", qop=auth, nc=00000001, cnonce="xyz""#;
        let params = parse_digest_header(header).unwrap();
        assert_eq!(params.username, "alice");
        assert_eq!(params.nc.as_deref(), Some("00000001"));
        assert_eq!(params.qop.as_deref(), Some("auth"));
    }

    #[test]
    fn digest_response_is_deterministic() {
        let ha1 = hex_hash(DigestAlgorithm::Md5, "alice:streaming:secret");
        let params = DigestParams {
            username: "alice".into(),
            realm: "streaming".into(),
            nonce: "n1".into(),
            uri: "rtsp://h/m.mov".into(),
            response: String::new(),
            qop: Some("auth".into()),
            nc: Some("00000001".into()),
            cnonce: Some("c1".into()),
            opaque: None,
        };
        let a = compute_digest_response(DigestAlgorithm::Md5, &ha1, "DESCRIBE", &params);
        let b = compute_digest_response(DigestAlgorithm::Md5, &ha1, "DESCRIBE", &params);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
