//! The packet-sending module interface (spec §6: "invoked by an RTP
//! Session with `(stream, deadline)`; returns next-call time in
//! microseconds"). The first `Preprocessor` module to add a stream to an
//! RTP Session becomes its packet-sending module (spec §4.5); file-backed
//! payload generation lives outside the core and implements this trait.

use std::time::Instant;

use crate::stream::RtpStream;

#[async_trait::async_trait]
pub trait PacketSendingModule: Send + Sync {
    /// Send whatever packets are due for `stream` by `deadline`. Returns
    /// the number of microseconds until this module should be called
    /// again for the same stream.
    async fn send_packets(&self, stream: &mut RtpStream, deadline: Instant) -> u64;
}
