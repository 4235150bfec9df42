//! The RTP Session (spec §3): a playing (or set-up-but-not-playing) media
//! session for one client, shared by refcount between its RTSP Session and
//! the server's RTP-session registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::packet_sender::PacketSendingModule;
use crate::stream::RtpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Paused,
    Playing,
}

/// Per-session digest auth bookkeeping (spec §4.8, §4.9): nonce/opaque/qop
/// plus the last-seen nonce-count, used to reject replays with `401
/// stale=true`.
pub struct DigestAuthState {
    pub nonce: String,
    pub opaque: String,
    pub qop: Option<String>,
    last_nonce_count: AtomicU32,
    pub stale: std::sync::atomic::AtomicBool,
}

impl DigestAuthState {
    pub fn new(nonce: String, opaque: String, qop: Option<String>) -> Self {
        DigestAuthState {
            nonce,
            opaque,
            qop,
            last_nonce_count: AtomicU32::new(0),
            stale: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Accept `nc` if it strictly increases on the last seen value;
    /// otherwise this is a replay: reject and mark the nonce stale
    /// (spec §4.8, §8).
    pub fn check_and_advance_nonce_count(&self, nc: u32) -> Result<()> {
        let prev = self.last_nonce_count.load(Ordering::SeqCst);
        if nc <= prev {
            self.stale.store(true, Ordering::SeqCst);
            return Err(Error::NonceCountReused);
        }
        self.last_nonce_count.store(nc, Ordering::SeqCst);
        Ok(())
    }
}

/// Aggregate counters the core tracks per RTP Session (spec §3).
#[derive(Default)]
pub struct Counters {
    pub bytes_sent: AtomicU64,
    pub packets_sent: AtomicU64,
    pub late_packets: AtomicU64,
}

pub struct RtpSession {
    pub id: u64,
    /// Keyed by SSRC. Behind a `Mutex` like the rest of this struct's
    /// mutable state since an [`RtpSession`] is shared by refcount and only
    /// ever reached through a shared reference (spec §3).
    pub streams: std::sync::Mutex<HashMap<u32, RtpStream>>,
    pub state: std::sync::Mutex<PlaybackState>,
    pub packet_sender: Option<Arc<dyn PacketSendingModule>>,
    /// The nonce/nonce-count currently tracked for this session's Digest
    /// auth (spec §3, §4.8: "tracked per RTP Session", not per server).
    /// `Mutex`-wrapped because a challenge issued on one request and
    /// checked on the next both need write access after the session is
    /// already shared by refcount.
    digest: std::sync::Mutex<Option<DigestAuthState>>,
    pub counters: Counters,
    created_at: Instant,
    play_started_at: std::sync::Mutex<Option<Instant>>,
    play_time_accum: std::sync::Mutex<Duration>,
    /// RTT measured by the `x-dynamic-rate` probe OPTIONS (spec §4.7),
    /// used by thinning decisions.
    pub measured_rtt: std::sync::Mutex<Option<Duration>>,
}

impl RtpSession {
    pub fn new(id: u64) -> Self {
        RtpSession {
            id,
            streams: std::sync::Mutex::new(HashMap::new()),
            state: std::sync::Mutex::new(PlaybackState::Idle),
            packet_sender: None,
            digest: std::sync::Mutex::new(None),
            counters: Counters::default(),
            created_at: Instant::now(),
            play_started_at: std::sync::Mutex::new(None),
            play_time_accum: std::sync::Mutex::new(Duration::ZERO),
            measured_rtt: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.lock().unwrap()
    }

    pub fn add_stream(&self, stream: RtpStream) {
        self.streams.lock().unwrap().insert(stream.ssrc, stream);
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Transition to `Playing`. Idempotent per spec §4.7's RFC 2326 ping
    /// rule: a second `PLAY` with no `Range` on an already-playing session
    /// must not re-trigger stream state changes; callers check
    /// `state() == Playing` *before* calling this to implement that.
    pub fn start_playing(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != PlaybackState::Playing {
            *self.play_started_at.lock().unwrap() = Some(Instant::now());
            *state = PlaybackState::Playing;
        }
    }

    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == PlaybackState::Playing {
            if let Some(started) = self.play_started_at.lock().unwrap().take() {
                *self.play_time_accum.lock().unwrap() += started.elapsed();
            }
        }
        *state = PlaybackState::Paused;
    }

    pub fn packets_sent(&self) -> u64 {
        self.counters.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.counters.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Total time spent in `Playing`, used as session-id entropy input
    /// (spec §4.9).
    pub fn play_time(&self) -> Duration {
        let accum = *self.play_time_accum.lock().unwrap();
        match *self.play_started_at.lock().unwrap() {
            Some(started) => accum + started.elapsed(),
            None => accum,
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.counters.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Start (or restart) tracking `nonce` for this session's Digest auth,
    /// without checking any nonce-count yet — called right after a fresh
    /// challenge is issued so the client's first authenticated retry has
    /// something to check `nc` against (spec §3, §4.8).
    pub fn seed_digest_nonce(&self, nonce: &str, opaque: &str, qop: Option<&str>) {
        *self.digest.lock().unwrap() = Some(DigestAuthState::new(
            nonce.to_string(),
            opaque.to_string(),
            qop.map(str::to_string),
        ));
    }

    /// The nonce/opaque this session is currently tracking, if any — used
    /// to re-issue the *same* challenge with `stale=true` on a nonce-count
    /// replay (spec §4.8) rather than minting a new nonce.
    pub fn digest_nonce_and_opaque(&self) -> Option<(String, String)> {
        self.digest
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| (d.nonce.clone(), d.opaque.clone()))
    }

    /// Check `nc` (already parsed from its hex wire form) against this
    /// session's tracked nonce, initializing tracking on first sight of
    /// `nonce`. Spec §4.8: nonce-count reuse on a nonce this session is
    /// already tracking is a replay; a `nonce` this session hasn't seen yet
    /// (the client's very first authenticated request, or a challenge
    /// re-issued after `TEARDOWN`) starts fresh instead of rejecting.
    pub fn check_or_init_nonce_count(&self, nonce: &str, opaque: &str, qop: Option<&str>, nc: u32) -> Result<()> {
        let mut guard = self.digest.lock().unwrap();
        match guard.as_ref() {
            Some(state) if state.nonce == nonce => {}
            _ => *guard = Some(DigestAuthState::new(nonce.to_string(), opaque.to_string(), qop.map(str::to_string))),
        }
        guard.as_ref().unwrap().check_and_advance_nonce_count(nc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_count_replay_is_rejected_and_marks_stale() {
        let digest = DigestAuthState::new("n1".into(), "op1".into(), Some("auth".into()));
        digest.check_and_advance_nonce_count(1).unwrap();
        let err = digest.check_and_advance_nonce_count(1).unwrap_err();
        assert_eq!(err, Error::NonceCountReused);
        assert!(digest.stale.load(Ordering::SeqCst));
    }

    #[test]
    fn nonce_count_must_strictly_increase() {
        let digest = DigestAuthState::new("n1".into(), "op1".into(), Some("auth".into()));
        digest.check_and_advance_nonce_count(5).unwrap();
        assert!(digest.check_and_advance_nonce_count(5).is_err());
        assert!(digest.check_and_advance_nonce_count(4).is_err());
        assert!(digest.check_and_advance_nonce_count(6).is_ok());
    }

    #[test]
    fn play_is_idempotent_for_state_purposes() {
        let session = RtpSession::new(1);
        session.start_playing();
        let first_start = *session.play_started_at.lock().unwrap();
        session.start_playing();
        let second_start = *session.play_started_at.lock().unwrap();
        assert_eq!(first_start, second_start, "already-playing start must not reset");
    }
}
