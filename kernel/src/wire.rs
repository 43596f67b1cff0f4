//! Jupyter wire protocol messages.
//!
//! Only the fields the broker reads are modeled; message content stays an
//! untyped JSON value because the gateway interleaves many content shapes on
//! one channel and the client classifies by `msg_type`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "5.0";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageHeader {
    pub msg_id: String,
    pub msg_type: String,
    pub username: String,
    pub session: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelMessage {
    pub header: MessageHeader,
    pub parent_header: MessageHeader,
    pub content: Value,
    pub channel: Option<String>,
    pub metadata: Value,
    pub buffers: Vec<Value>,
}

impl KernelMessage {
    /// Build an `execute_request` frame for the shell channel.
    pub fn execute_request(session_id: &str, msg_id: &str, code: &str) -> Self {
        Self {
            header: MessageHeader {
                msg_id: msg_id.to_string(),
                msg_type: "execute_request".to_string(),
                username: String::new(),
                session: session_id.to_string(),
                version: PROTOCOL_VERSION.to_string(),
            },
            parent_header: MessageHeader::default(),
            content: json!({
                "code": code,
                "silent": false,
                "store_history": false,
                "user_expressions": {},
                "allow_stdin": false,
            }),
            channel: Some("shell".to_string()),
            metadata: json!({}),
            buffers: Vec::new(),
        }
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// The request id this message belongs to, if any.
    pub fn parent_msg_id(&self) -> Option<&str> {
        if self.parent_header.msg_id.is_empty() {
            None
        } else {
            Some(&self.parent_header.msg_id)
        }
    }
}
