//! Approval plane: the server-side channel and the client that answers it.

pub mod channel;
pub mod client;

pub use channel::ApprovalChannel;
pub use client::{ApprovalCallback, ApprovalClient, ApprovalClientError, ApprovalRequest};
