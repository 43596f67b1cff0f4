//! rmcp-backed client for one remote tool provider.

use std::time::Duration;

use rmcp::{
    model::{CallToolRequestParam, CallToolResult, Tool},
    service::RunningService,
    transport::{
        sse_client::SseClientConfig,
        streamable_http_client::StreamableHttpClientTransportConfig,
        ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
    },
    RoleClient, ServiceExt,
};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::{
    error::{ProviderError, ProviderResult},
    params::ProviderParams,
};

/// A live connection to one remote tool provider.
///
/// Created lazily by the tool server on first use of a provider name and
/// kept open until the server is reset or stopped.
pub struct ProviderClient {
    name: String,
    service: RunningService<RoleClient, ()>,
}

impl ProviderClient {
    /// Connect to a provider, selecting the transport from `params`.
    pub async fn connect(
        name: impl Into<String>,
        params: &ProviderParams,
        connect_timeout: Duration,
    ) -> ProviderResult<Self> {
        let name = name.into();
        let service = tokio::time::timeout(connect_timeout, Self::serve(params))
            .await
            .map_err(|_| ProviderError::ConnectTimeout {
                name: name.clone(),
                timeout: connect_timeout,
            })??;

        info!(provider = %name, transport = ?params.transport(), "connected to tool provider");
        Ok(Self { name, service })
    }

    async fn serve(params: &ProviderParams) -> ProviderResult<RunningService<RoleClient, ()>> {
        match params {
            ProviderParams::Stdio { command, args, env } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(env.iter())
                            .stderr(std::process::Stdio::inherit());
                    }),
                )
                .map_err(|e| ProviderError::Transport(format!("create stdio transport: {e}")))?;

                ().serve(transport).await.map_err(|e| {
                    ProviderError::ConnectionFailed(format!("initialize stdio client: {e}"))
                })
            }

            ProviderParams::Http {
                url,
                headers,
                sse: true,
            } => {
                let http_client = build_http_client(headers)?;
                let sse_config = SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                };

                let transport = SseClientTransport::start_with_client(http_client, sse_config)
                    .await
                    .map_err(|e| ProviderError::Transport(format!("create SSE transport: {e}")))?;

                ().serve(transport).await.map_err(|e| {
                    ProviderError::ConnectionFailed(format!("initialize SSE client: {e}"))
                })
            }

            ProviderParams::Http {
                url,
                headers,
                sse: false,
            } => {
                let http_client = build_http_client(headers)?;
                let config = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                let transport = StreamableHttpClientTransport::with_client(http_client, config);

                ().serve(transport).await.map_err(|e| {
                    ProviderError::ConnectionFailed(format!("initialize streamable client: {e}"))
                })
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// List all tools exposed by the provider.
    pub async fn list_tools(&self) -> ProviderResult<Vec<Tool>> {
        self.service
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| ProviderError::Transport(format!("list tools: {e}")))
    }

    /// Invoke a tool and flatten its result to a single JSON value.
    pub async fn run(&self, tool: &str, arguments: Map<String, Value>) -> ProviderResult<Value> {
        debug!(provider = %self.name, tool, "invoking provider tool");

        let result = self
            .service
            .peer()
            .call_tool(CallToolRequestParam {
                name: tool.to_string().into(),
                arguments: Some(arguments),
            })
            .await
            .map_err(|e| ProviderError::Transport(format!("call tool '{tool}': {e}")))?;

        flatten_result(tool, result)
    }

    /// Shut the provider connection down.
    pub async fn close(self) -> ProviderResult<()> {
        self.service
            .cancel()
            .await
            .map_err(|e| ProviderError::Transport(format!("close provider: {e}")))?;
        Ok(())
    }
}

/// Collapse an MCP tool result into one JSON value.
///
/// Structured content wins when present; otherwise text contents are joined
/// with newlines. `is_error` results surface as [`ProviderError::Tool`].
fn flatten_result(tool: &str, result: CallToolResult) -> ProviderResult<Value> {
    let text = || {
        result
            .content
            .iter()
            .filter_map(|item| item.as_text().map(|t| t.text.clone()))
            .collect::<Vec<_>>()
            .join("\n")
    };

    if result.is_error.unwrap_or(false) {
        return Err(ProviderError::Tool {
            tool: tool.to_string(),
            message: text(),
        });
    }

    if let Some(structured) = result.structured_content {
        return Ok(structured);
    }

    Ok(Value::String(text()))
}

fn build_http_client(headers: &std::collections::HashMap<String, String>) -> ProviderResult<reqwest::Client> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| ProviderError::InvalidParams(format!("bad header name '{key}': {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| ProviderError::InvalidParams(format!("bad header value for '{key}': {e}")))?;
        header_map.insert(name, value);
    }

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .default_headers(header_map)
        .build()
        .map_err(|e| ProviderError::Transport(format!("build HTTP client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::Content;
    use serde_json::json;

    #[test]
    fn test_flatten_single_text() {
        let result = CallToolResult::success(vec![Content::text("hello")]);
        assert_eq!(flatten_result("t", result).unwrap(), json!("hello"));
    }

    #[test]
    fn test_flatten_joins_multiple_texts() {
        let result = CallToolResult::success(vec![Content::text("one"), Content::text("two")]);
        assert_eq!(flatten_result("t", result).unwrap(), json!("one\ntwo"));
    }

    #[test]
    fn test_flatten_prefers_structured_content() {
        let mut result = CallToolResult::success(vec![Content::text("ignored")]);
        result.structured_content = Some(json!({"status": "ok", "count": 3}));
        assert_eq!(
            flatten_result("t", result).unwrap(),
            json!({"status": "ok", "count": 3})
        );
    }

    #[test]
    fn test_flatten_error_result() {
        let result = CallToolResult::error(vec![Content::text("boom")]);
        let err = flatten_result("my_tool", result).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("my_tool"));
        assert!(message.contains("boom"));
    }

    #[test]
    fn test_build_http_client_rejects_bad_header() {
        let mut headers = std::collections::HashMap::new();
        headers.insert("bad name".to_string(), "v".to_string());
        assert!(build_http_client(&headers).is_err());
    }
}
