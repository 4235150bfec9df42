use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no such RTP stream on this session")]
    NoSuchStream,

    #[error("nonce-count reused: request replay")]
    NonceCountReused,

    #[error("operation not valid while session is {0:?}")]
    InvalidState(crate::session::PlaybackState),
}
