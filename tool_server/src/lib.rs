//! HTTP tool server with an out-of-band approval plane.
//!
//! In-kernel code invokes remote tools by POSTing to `/run`; every call is
//! gated on the singleton approval channel attached at `/approval` before it
//! is forwarded to the named MCP provider. Provider connections are cached
//! per provider name and flushed by `PUT /reset`.

pub mod approval;
pub mod error;
pub mod runner;
pub mod server;

pub use approval::{ApprovalChannel, ApprovalClient, ApprovalClientError, ApprovalRequest};
pub use error::{ApprovalError, ToolServerError};
pub use runner::{reset, status, ToolRunnerClient, ToolRunnerError};
pub use server::{ToolRunRequest, ToolServer, ToolServerConfig};
