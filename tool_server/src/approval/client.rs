//! Client side of the approval plane.
//!
//! Connects to a tool server's `/approval` socket, decodes incoming
//! JSON-RPC `approve` requests into [`ApprovalRequest`] values, and hands
//! them to a caller-supplied callback. The callback decides by consuming the
//! request with [`ApprovalRequest::approve`] or [`ApprovalRequest::reject`].

use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// How long to watch a fresh connection for the server's rejection close.
///
/// The channel protocol carries no attach ack; a rejected second attach is
/// only visible as an immediate policy close after the handshake.
const ATTACH_PROBE: Duration = Duration::from_millis(100);

pub type ApprovalCallback = Box<dyn Fn(ApprovalRequest) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ApprovalClientError {
    #[error("Failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    /// The server already has an approval client attached.
    #[error("Approval channel already open")]
    Rejected,

    #[error("Approval connection closed")]
    ConnectionClosed,
}

/// One pending tool call awaiting a decision.
///
/// The decision is observed at most once: `approve` and `reject` consume the
/// request. Dropping it without responding leaves the server-side request to
/// its timeout.
pub struct ApprovalRequest {
    pub server_name: String,
    pub tool_name: String,
    pub tool_args: Map<String, Value>,
    responder: Responder,
}

struct Responder {
    id: Value,
    out: mpsc::UnboundedSender<Message>,
}

impl ApprovalRequest {
    /// Assemble a request from decoded frame fields. The responder sends the
    /// JSON-RPC decision frame through `out`.
    pub fn new(
        server_name: String,
        tool_name: String,
        tool_args: Map<String, Value>,
        id: Value,
        out: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            server_name,
            tool_name,
            tool_args,
            responder: Responder { id, out },
        }
    }

    pub async fn approve(self) -> Result<(), ApprovalClientError> {
        self.respond(true).await
    }

    pub async fn reject(self) -> Result<(), ApprovalClientError> {
        self.respond(false).await
    }

    pub async fn respond(self, result: bool) -> Result<(), ApprovalClientError> {
        let frame = json!({
            "jsonrpc": "2.0",
            "result": result,
            "id": self.responder.id,
        });
        self.responder
            .out
            .send(Message::Text(frame.to_string()))
            .map_err(|_| ApprovalClientError::ConnectionClosed)
    }
}

impl fmt::Display for ApprovalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kwargs = self
            .tool_args
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}.{}({kwargs})", self.server_name, self.tool_name)
    }
}

impl fmt::Debug for ApprovalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovalRequest")
            .field("server_name", &self.server_name)
            .field("tool_name", &self.tool_name)
            .field("tool_args", &self.tool_args)
            .finish()
    }
}

/// WebSocket client that receives approval requests from a tool server.
pub struct ApprovalClient {
    out_tx: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ApprovalClient {
    /// Connect to `ws://{host}:{port}/approval` and start dispatching
    /// incoming requests to `callback`.
    ///
    /// A server that already has a client attached closes the socket right
    /// after the handshake; that surfaces as
    /// [`ApprovalClientError::Rejected`] rather than a connected client.
    pub async fn connect(
        host: &str,
        port: u16,
        callback: ApprovalCallback,
    ) -> Result<Self, ApprovalClientError> {
        let url = format!("ws://{host}:{port}/approval");
        let (stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| ApprovalClientError::Connect {
                url: url.clone(),
                message: e.to_string(),
            })?;

        let (mut sink, mut source) = stream.split();

        // Probe for the rejection close. Silence within the window means
        // the attach took; any live frame that arrives instead is kept and
        // replayed to the reader.
        let early_frame = match tokio::time::timeout(ATTACH_PROBE, source.next()).await {
            Err(_) => None,
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                return Err(ApprovalClientError::Rejected);
            }
            Ok(Some(Ok(frame))) => Some(frame),
            Ok(Some(Err(e))) => {
                return Err(ApprovalClientError::Connect {
                    url,
                    message: e.to_string(),
                });
            }
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let request_out = out_tx.clone();
        let reader = tokio::spawn(async move {
            let mut replay = early_frame;
            loop {
                let message = match replay.take() {
                    Some(frame) => Ok(frame),
                    None => match source.next().await {
                        Some(message) => message,
                        None => break,
                    },
                };
                match message {
                    Ok(Message::Text(text)) => dispatch(&text, &request_out, &callback),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            debug!("approval client reader finished");
        });

        Ok(Self {
            out_tx,
            reader,
            writer,
        })
    }

    /// Close the connection and wait for both tasks to finish.
    pub async fn disconnect(self) {
        let _ = self.out_tx.send(Message::Close(None));
        drop(self.out_tx);
        let _ = self.writer.await;
        let _ = self.reader.await;
    }
}

fn dispatch(text: &str, out: &mpsc::UnboundedSender<Message>, callback: &ApprovalCallback) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("ignoring malformed approval frame: {e}");
            return;
        }
    };

    if frame["method"] != "approve" {
        return;
    }

    let params = &frame["params"];
    let request = ApprovalRequest::new(
        params["server_name"].as_str().unwrap_or_default().to_string(),
        params["tool_name"].as_str().unwrap_or_default().to_string(),
        params["tool_args"].as_object().cloned().unwrap_or_default(),
        frame["id"].clone(),
        out.clone(),
    );

    callback(request);
}
