//! Drives an RTP Session's attached packet-sending module (spec §2
//! component 8: "dispatch to packet-sending modules"; spec §6: "invoked by
//! an RTP Session with `(stream, deadline)`; returns next-call time in
//! microseconds"). Actual payload generation (MP4/hinted-file reading) is
//! an external collaborator per spec §1; this module only owns the loop
//! that keeps calling back into whatever module attached itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::trace;

use crate::session::{PlaybackState, RtpSession};

/// Spawn the loop that repeatedly calls `session`'s packet-sending module
/// for every stream it owns, for as long as the session stays `Playing`.
/// A no-op (returns an already-finished handle) if no packet-sending
/// module is attached — a default deployment with no registered media
/// reader has nothing to pump.
pub fn spawn_packet_pump(session: Arc<RtpSession>) -> Option<JoinHandle<()>> {
    let sender = session.packet_sender.clone()?;
    Some(tokio::spawn(async move {
        loop {
            if session.state() != PlaybackState::Playing {
                return;
            }

            let ssrcs: Vec<u32> = session.streams.lock().unwrap().keys().copied().collect();
            if ssrcs.is_empty() {
                return;
            }

            let mut next_call = Duration::from_millis(20);
            for ssrc in ssrcs {
                let Some(mut stream) = session.streams.lock().unwrap().remove(&ssrc) else {
                    continue;
                };
                let deadline = Instant::now();
                let next_micros = sender.send_packets(&mut stream, deadline).await;
                session.streams.lock().unwrap().insert(ssrc, stream);
                next_call = next_call.min(Duration::from_micros(next_micros));
            }

            trace!(session = session.id, ?next_call, "packet pump sleeping");
            tokio::time::sleep(next_call).await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{PayloadInfo, RtpStream, Transport};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingSender {
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl crate::packet_sender::PacketSendingModule for CountingSender {
        async fn send_packets(&self, _stream: &mut RtpStream, _deadline: Instant) -> u64 {
            self.calls.fetch_add(1, Ordering::SeqCst);
            5_000
        }
    }

    #[tokio::test]
    async fn pump_stops_once_session_leaves_playing() {
        let mut session = RtpSession::new(1);
        let sender = Arc::new(CountingSender {
            calls: AtomicU32::new(0),
        });
        session.packet_sender = Some(sender.clone());
        let session = Arc::new(session);
        session.add_stream(RtpStream::new(
            1,
            PayloadInfo {
                payload_type: 96,
                clock_rate: 90_000,
                encoding_name: "unknown".into(),
            },
            Transport::Interleaved(0, 1),
        ));
        session.start_playing();

        let handle = spawn_packet_pump(session.clone()).expect("sender attached");
        tokio::time::sleep(Duration::from_millis(15)).await;
        session.pause();

        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(sender.calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn no_pump_spawned_without_a_packet_sender() {
        let session = Arc::new(RtpSession::new(1));
        assert!(spawn_packet_pump(session).is_none());
    }
}
