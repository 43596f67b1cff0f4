//! Code-execution broker for agentic workflows.
//!
//! A caller submits snippets of interpreted code; the broker drives a
//! stateful kernel, streams incremental output, and interposes on every
//! remote tool call the code attempts, pausing execution until an
//! out-of-band approval decision arrives. The execution budget excludes
//! time spent waiting for those decisions.

pub mod broker;
pub mod budget;
pub mod config;
pub mod execution;

pub use broker::{CodeBroker, ExecuteOptions};
pub use config::{pick_free_port, BrokerConfig};
pub use execution::{ApprovalRequest, CodeExecution, ExecutionError, ExecutionEvent};

pub use codebroker_kernel::ExecutionResult;
