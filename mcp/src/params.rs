//! Provider connection params and transport detection.
//!
//! Params arrive as an untyped JSON object supplied by the caller (typically
//! an agent registering a provider). The transport is selected by the shape
//! of the object, never by an explicit tag: `command` means a stdio child
//! process, `url` means one of the two HTTP framings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{ProviderError, ProviderResult};

/// Transport framing used to reach a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Parsed provider connection params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProviderParams {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(skip)]
        sse: bool,
    },
}

/// Select the transport from the shape of a params object.
///
/// Pure function: `command` wins over `url` if both are present; a `url`
/// whose path ends in `/sse` selects SSE framing, any other `url` selects
/// streamable HTTP.
pub fn detect_transport(params: &Map<String, Value>) -> ProviderResult<TransportKind> {
    if params.contains_key("command") {
        return Ok(TransportKind::Stdio);
    }

    match params.get("url") {
        Some(Value::String(url)) => {
            let parsed = Url::parse(url)
                .map_err(|e| ProviderError::InvalidParams(format!("bad url '{url}': {e}")))?;
            if parsed.path().trim_end_matches('/').ends_with("/sse") {
                Ok(TransportKind::Sse)
            } else {
                Ok(TransportKind::StreamableHttp)
            }
        }
        Some(other) => Err(ProviderError::InvalidParams(format!(
            "url must be a string, got {other}"
        ))),
        None => Err(ProviderError::InvalidParams(
            "params must contain either 'command' or 'url'".to_string(),
        )),
    }
}

impl ProviderParams {
    /// Parse a raw params value, detecting the transport from its shape.
    pub fn from_value(value: &Value) -> ProviderResult<Self> {
        let map = value.as_object().ok_or_else(|| {
            ProviderError::InvalidParams(format!("params must be an object, got {value}"))
        })?;

        let kind = detect_transport(map)?;
        let mut params: ProviderParams = serde_json::from_value(value.clone())
            .map_err(|e| ProviderError::InvalidParams(e.to_string()))?;

        if let ProviderParams::Http { sse, .. } = &mut params {
            *sse = kind == TransportKind::Sse;
        }
        Ok(params)
    }

    pub fn transport(&self) -> TransportKind {
        match self {
            ProviderParams::Stdio { .. } => TransportKind::Stdio,
            ProviderParams::Http { sse: true, .. } => TransportKind::Sse,
            ProviderParams::Http { sse: false, .. } => TransportKind::StreamableHttp,
        }
    }
}
