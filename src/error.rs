use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum RegistrarError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {waited:?} waiting for an admission slot")]
    TimedOut { waited: Duration },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl RegistrarError {
    /// Whether the caller may reasonably try the same call again later.
    pub fn is_retryable(&self) -> bool {
        match self {
            RegistrarError::Config(_) => false,
            RegistrarError::TimedOut { .. } => true,
            RegistrarError::Transport(e) => e.is_retryable(),
        }
    }
}
