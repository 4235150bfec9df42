use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Cross-cutting errors shared by the ambient stack (config, task
/// scheduling). Protocol- and session-level errors live in their own
/// crates; this is deliberately small.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("task limit reached for {layer}: {active} active tasks")]
    TaskLimitReached { layer: String, active: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
