//! Tool server error types.

use thiserror::Error;

/// Outcome of an approval request that did not produce a decision.
///
/// The `Display` text of these variants is embedded verbatim in the `/run`
/// failure envelope, so changing it is a wire-format change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    /// Approval is required but no approval client is attached.
    #[error("not connected")]
    NotConnected,

    /// The per-request timeout elapsed before a decision arrived.
    #[error("expired")]
    Expired,

    /// The approval client went away while the request was pending.
    #[error("disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ToolServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server at {0} did not become ready")]
    NotReady(String),

    #[error("Approval channel already open")]
    ApprovalChannelOpen,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Provider(#[from] codebroker_mcp::ProviderError),
}
