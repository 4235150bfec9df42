//! RTP Session and RTP Stream types (spec §3), and the packet-sending
//! module interface (spec §6) that drives them.

pub mod error;
pub mod packet_sender;
pub mod pump;
pub mod session;
pub mod stream;

pub use error::{Error, Result};
pub use packet_sender::PacketSendingModule;
pub use pump::spawn_packet_pump;
pub use session::{Counters, DigestAuthState, PlaybackState, RtpSession};
pub use stream::{PayloadInfo, RtpStream, ThinningParams, Transport};
