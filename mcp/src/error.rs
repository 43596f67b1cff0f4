//! Provider error types.

use std::time::Duration;

use thiserror::Error;

pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Invalid provider params: {0}")]
    InvalidParams(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection to '{name}' timed out after {timeout:?}")]
    ConnectTimeout { name: String, timeout: Duration },

    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
