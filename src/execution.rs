//! Execution events, errors, and the caller-facing event stream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use codebroker_kernel::{ExecutionResult, Interrupter, KernelError, OutputEvent};
use codebroker_tool_server::approval::client::ApprovalClientError;
use codebroker_tool_server::ApprovalRequest as ChannelApprovalRequest;

use crate::budget::{Budget, BudgetClock};

/// Terminal failure of one execution.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The submitted code raised.
    #[error("{name}: {value}\n{traceback}")]
    Execution {
        name: String,
        value: String,
        traceback: String,
    },

    /// A remote tool invocation failed and the code did not catch it.
    #[error("Tool call failed: {0}")]
    Tool(String),

    /// The approval plane faulted at the coordinator layer.
    #[error("Approval channel failure: {0}")]
    Approval(String),

    /// The pause-aware execution budget was exceeded.
    #[error("Execution timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// Kernel or approval connection went away. Fatal to the session.
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// The exception class raised by generated provider stubs when a `/run`
/// call returns a failure envelope; used to classify kernel errors.
const TOOL_ERROR_NAME: &str = "ToolRunnerError";

impl From<KernelError> for ExecutionError {
    fn from(error: KernelError) -> Self {
        match error {
            KernelError::Execution { name, value, .. } if name == TOOL_ERROR_NAME => {
                ExecutionError::Tool(value)
            }
            KernelError::Execution {
                name,
                value,
                traceback,
            } => ExecutionError::Execution {
                name,
                value,
                traceback,
            },
            KernelError::Timeout(limit) => ExecutionError::Timeout(limit),
            KernelError::CreateKernel(_)
            | KernelError::GatewayNotReady(_)
            | KernelError::GatewaySpawn(_) => ExecutionError::Config(error.to_string()),
            other => ExecutionError::Transport(other.to_string()),
        }
    }
}

/// Element of the merged event stream for one execution.
#[derive(Debug)]
pub enum ExecutionEvent {
    /// A tool call is blocked awaiting a decision; the budget is paused
    /// until one is made.
    Approval(ApprovalRequest),
    /// A text fragment, emitted only when streaming was requested.
    Chunk(String),
    /// A generated image, emitted only when streaming was requested.
    Image(PathBuf),
    /// Terminal event of a successful execution.
    Result(ExecutionResult),
}

/// A pending tool call surfaced to the caller.
///
/// Deciding consumes the request and resumes the execution budget.
pub struct ApprovalRequest {
    inner: ChannelApprovalRequest,
    clock: Arc<BudgetClock>,
}

impl ApprovalRequest {
    pub(crate) fn new(inner: ChannelApprovalRequest, clock: Arc<BudgetClock>) -> Self {
        Self { inner, clock }
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    pub fn tool_name(&self) -> &str {
        &self.inner.tool_name
    }

    pub fn tool_args(&self) -> &Map<String, Value> {
        &self.inner.tool_args
    }

    pub async fn approve(self) -> Result<(), ExecutionError> {
        self.respond(true).await
    }

    pub async fn reject(self) -> Result<(), ExecutionError> {
        self.respond(false).await
    }

    pub async fn respond(self, approved: bool) -> Result<(), ExecutionError> {
        self.clock.on_decision();
        self.inner
            .respond(approved)
            .await
            .map_err(|e: ApprovalClientError| ExecutionError::Approval(e.to_string()))
    }
}

impl std::fmt::Display for ApprovalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::fmt::Debug for ApprovalRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.inner, f)
    }
}

/// Items the execution worker and the approval subscription enqueue.
pub(crate) enum QueueItem {
    Approval(ChannelApprovalRequest),
    Output(OutputEvent),
    Done(ExecutionResult),
    Failed(ExecutionError),
}

/// Interrupt handle slot, filled once the worker binds a kernel.
pub(crate) type InterruptSlot = Arc<Mutex<Option<Interrupter>>>;

/// One submitted execution's merged, ordered event stream.
///
/// Single consumer; after the terminal event, `next_event` returns `None`.
/// Dropping the handle stops consumption and lets the worker interrupt the
/// kernel best-effort.
pub struct CodeExecution {
    budget: Budget<QueueItem>,
    interrupt: InterruptSlot,
    stream_output: bool,
    result: Option<ExecutionResult>,
    terminated: bool,
}

impl CodeExecution {
    pub(crate) fn new(budget: Budget<QueueItem>, interrupt: InterruptSlot, stream_output: bool) -> Self {
        Self {
            budget,
            interrupt,
            stream_output,
            result: None,
            terminated: false,
        }
    }

    /// Next event, or `None` after the terminal event.
    ///
    /// Emitting an approval pauses the budget; the caller's decision resumes
    /// it. On budget expiry the kernel is interrupted before the timeout is
    /// surfaced.
    pub async fn next_event(&mut self) -> Result<Option<ExecutionEvent>, ExecutionError> {
        if self.terminated {
            return Ok(None);
        }

        loop {
            let item = match self.budget.next_item().await {
                Ok(item) => item,
                Err(exceeded) => {
                    self.terminated = true;
                    let interrupter = self.interrupt.lock().clone();
                    if let Some(interrupter) = interrupter {
                        interrupter.interrupt().await;
                    }
                    return Err(ExecutionError::Timeout(exceeded.0));
                }
            };

            match item {
                None => {
                    self.terminated = true;
                    return Err(ExecutionError::Transport(
                        "execution worker stopped before completing".to_string(),
                    ));
                }
                Some(QueueItem::Approval(inner)) => {
                    let clock = self.budget.clock();
                    clock.pause();
                    return Ok(Some(ExecutionEvent::Approval(ApprovalRequest::new(
                        inner, clock,
                    ))));
                }
                Some(QueueItem::Output(OutputEvent::Chunk(text))) => {
                    if self.stream_output {
                        return Ok(Some(ExecutionEvent::Chunk(text)));
                    }
                }
                Some(QueueItem::Output(OutputEvent::Image(path))) => {
                    if self.stream_output {
                        return Ok(Some(ExecutionEvent::Image(path)));
                    }
                }
                Some(QueueItem::Done(result)) => {
                    self.terminated = true;
                    self.result = Some(result.clone());
                    return Ok(Some(ExecutionEvent::Result(result)));
                }
                Some(QueueItem::Failed(error)) => {
                    self.terminated = true;
                    return Err(error);
                }
            }
        }
    }

    /// Wait for the terminal result, rejecting any approval requests that
    /// arrive on the way.
    ///
    /// Interactive callers should consume [`next_event`](Self::next_event)
    /// instead and decide approvals themselves.
    pub async fn result(&mut self) -> Result<ExecutionResult, ExecutionError> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }

        while let Some(event) = self.next_event().await? {
            match event {
                ExecutionEvent::Result(result) => return Ok(result),
                ExecutionEvent::Approval(request) => {
                    debug!("rejecting unattended approval request: {request}");
                    let _ = request.reject().await;
                }
                ExecutionEvent::Chunk(_) | ExecutionEvent::Image(_) => {}
            }
        }

        Err(ExecutionError::Transport(
            "execution ended without a result".to_string(),
        ))
    }
}
