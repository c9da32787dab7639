//! Pacing error types.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum PacerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Target has blocked this client; stop crawling")]
    Blocked,
    #[error("{0} consecutive failed requests; stop crawling")]
    TooManyFailures(u32),
    #[error("Pacing cancelled")]
    Cancelled,
    #[error("Pacer task is no longer running")]
    ActorClosed,
}
