//! An RTP Stream (spec §3): one media substream, the unit a single `SETUP`
//! produces, owned exclusively by its RTP Session.

use rtsp_transport::SocketPairHandle;

/// How this stream's RTP/RTCP traffic reaches the client.
pub enum Transport {
    /// Plain UDP: the Socket Pool's shared pair carries this stream's
    /// packets (spec §3, §4.4).
    Udp(SocketPairHandle),
    /// RFC 2326 §10.12 interleaved framing over the RTSP TCP connection;
    /// `(rtp_channel, rtcp_channel)`.
    Interleaved(u8, u8),
}

/// Payload metadata a `Preprocessor` module attaches at `SETUP` time.
#[derive(Debug, Clone)]
pub struct PayloadInfo {
    pub payload_type: u8,
    pub clock_rate: u32,
    pub encoding_name: String,
}

/// Dynamic thinning parameters (spec §4.7, GLOSSARY "Thinning"): adjusted
/// in response to measured client-perceived latency.
#[derive(Debug, Clone, Default)]
pub struct ThinningParams {
    /// Fraction (0-100) of packets currently being dropped to relieve a
    /// slow client.
    pub drop_percent: u8,
    /// Measured round-trip time from the `x-dynamic-rate` OPTIONS probe
    /// (spec §4.7), if one has completed.
    pub measured_rtt: Option<std::time::Duration>,
}

pub struct RtpStream {
    pub ssrc: u32,
    pub payload: PayloadInfo,
    pub transport: Transport,
    pub thinning: ThinningParams,
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

impl RtpStream {
    pub fn new(ssrc: u32, payload: PayloadInfo, transport: Transport) -> Self {
        RtpStream {
            ssrc,
            payload,
            transport,
            thinning: ThinningParams::default(),
            packets_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.packets_sent += 1;
        self.bytes_sent += bytes as u64;
    }
}
