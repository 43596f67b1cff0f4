//! Kernel error types.

use std::time::Duration;

use thiserror::Error;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Debug, Error)]
pub enum KernelError {
    /// Code executed in the kernel raised an error.
    #[error("{name}: {value}\n{traceback}")]
    Execution {
        name: String,
        value: String,
        traceback: String,
    },

    /// The execution exceeded its deadline and the kernel was interrupted.
    #[error("Execution timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The kernel connection went away mid-session. Fatal to the session.
    #[error("Kernel disconnected")]
    Disconnected,

    /// A second execution was submitted while one was in flight.
    #[error("An execution is already in flight")]
    Busy,

    #[error("Not connected to a kernel")]
    NotConnected,

    #[error("Failed to create kernel after {0} attempts")]
    CreateKernel(usize),

    #[error("Kernel gateway at {0} did not become ready")]
    GatewayNotReady(String),

    #[error("Failed to spawn kernel gateway: {0}")]
    GatewaySpawn(std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
