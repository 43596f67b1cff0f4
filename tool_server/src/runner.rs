//! HTTP client for the tool server's `/run` surface.
//!
//! Generated provider stubs use this to route their tool calls through the
//! approval gate. Both an async and a blocking call style are provided; the
//! blocking one exists for synchronous call sites inside kernel code.

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ToolRunnerError {
    /// The server returned a failure envelope.
    #[error("{0}")]
    Tool(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Client for running one provider's tools through a tool server.
pub struct ToolRunnerClient {
    server_name: String,
    server_params: Value,
    run_url: String,
}

impl ToolRunnerClient {
    pub fn new(
        server_name: impl Into<String>,
        server_params: Value,
        host: &str,
        port: u16,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            server_params,
            run_url: format!("http://{host}:{port}/run"),
        }
    }

    /// Invoke a tool, waiting for approval and the provider round trip.
    pub async fn run(&self, tool: &str, arguments: Value) -> Result<Value, ToolRunnerError> {
        let response = reqwest::Client::new()
            .post(&self.run_url)
            .json(&self.body(tool, arguments))
            .send()
            .await?
            .error_for_status()?;

        unwrap_envelope(response.json().await?)
    }

    /// Blocking variant of [`run`](Self::run).
    ///
    /// Must not be called from an async context.
    pub fn run_sync(&self, tool: &str, arguments: Value) -> Result<Value, ToolRunnerError> {
        let response = reqwest::blocking::Client::new()
            .post(&self.run_url)
            .json(&self.body(tool, arguments))
            .send()?
            .error_for_status()?;

        unwrap_envelope(response.json()?)
    }

    fn body(&self, tool: &str, arguments: Value) -> Value {
        json!({
            "server_name": self.server_name,
            "server_params": self.server_params,
            "tool": tool,
            "arguments": arguments,
        })
    }
}

fn unwrap_envelope(mut envelope: Value) -> Result<Value, ToolRunnerError> {
    if let Some(error) = envelope.get("error").and_then(Value::as_str) {
        return Err(ToolRunnerError::Tool(error.to_string()));
    }
    match envelope.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(ToolRunnerError::Tool(format!(
            "malformed run envelope: {envelope}"
        ))),
    }
}

/// Clear all provider bindings on a tool server.
pub async fn reset(host: &str, port: u16) -> Result<(), ToolRunnerError> {
    reqwest::Client::new()
        .put(format!("http://{host}:{port}/reset"))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

/// Probe a tool server's liveness.
pub async fn status(host: &str, port: u16) -> Result<(), ToolRunnerError> {
    reqwest::Client::new()
        .get(format!("http://{host}:{port}/status"))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
