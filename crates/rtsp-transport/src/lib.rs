//! The Listener Set and UDP Socket Pool (spec §4.4): TCP accept tasks for
//! RTSP, and shared, refcounted RTP/RTCP UDP socket pairs.

pub mod error;
pub mod listener;
pub mod socket_pool;

pub use error::{Error, Result};
pub use listener::{AcceptHandler, ListenerSet};
pub use socket_pool::{SocketPairHandle, SocketPool, UdpSocketPair};
