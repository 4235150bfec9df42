use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no listener bound on any configured address")]
    NoListenersBound,

    #[error("could not find a free RTP/RTCP port pair near base {0} on {1}")]
    NoFreePortPair(u16, std::net::IpAddr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
