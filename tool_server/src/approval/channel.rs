//! Server side of the approval plane.
//!
//! At most one approval client is attached at a time. Tool calls block in
//! [`ApprovalChannel::request`] until the client answers the JSON-RPC
//! `approve` request, the per-request timeout elapses, or the client
//! disconnects.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ApprovalError;

/// JSON-RPC response frame sent by the approval client.
#[derive(Debug, Deserialize)]
struct ApprovalResponse {
    id: Uuid,
    result: bool,
}

/// The singleton approval channel owned by one tool server.
///
/// All state is instance-local so two servers can run side by side in one
/// process.
pub struct ApprovalChannel {
    approval_required: bool,
    approval_timeout: Option<Duration>,

    /// Attach slot: the outbound frame sender of the connected client.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,

    /// Pending approval requests awaiting a JSON-RPC response.
    pending: DashMap<Uuid, oneshot::Sender<bool>>,

    /// Cancelled when the owning server shuts down.
    closed: CancellationToken,
}

impl ApprovalChannel {
    pub fn new(approval_required: bool, approval_timeout: Option<Duration>) -> Self {
        Self {
            approval_required,
            approval_timeout,
            outbound: Mutex::new(None),
            pending: DashMap::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Whether an approval client is currently attached.
    pub fn is_open(&self) -> bool {
        self.outbound.lock().is_some()
    }

    /// Request a decision for one tool call.
    ///
    /// Returns `Ok(true)` immediately when approval is not required. Fails
    /// fast with [`ApprovalError::NotConnected`] when it is required but no
    /// client is attached.
    pub async fn request(
        &self,
        server_name: &str,
        tool_name: &str,
        tool_args: &Map<String, Value>,
    ) -> Result<bool, ApprovalError> {
        if !self.approval_required {
            return Ok(true);
        }

        let outbound = self
            .outbound
            .lock()
            .clone()
            .ok_or(ApprovalError::NotConnected)?;

        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "method": "approve",
            "params": {
                "server_name": server_name,
                "tool_name": tool_name,
                "tool_args": tool_args,
            },
            "id": request_id,
        });

        if outbound.send(frame.to_string()).is_err() {
            self.pending.remove(&request_id);
            return Err(ApprovalError::Disconnected);
        }

        debug!(%request_id, server_name, tool_name, "approval request sent");

        let decision = match self.approval_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Err(_) => Err(ApprovalError::Expired),
                Ok(Ok(approved)) => Ok(approved),
                Ok(Err(_)) => Err(ApprovalError::Disconnected),
            },
            None => rx.await.map_err(|_| ApprovalError::Disconnected),
        };

        self.pending.remove(&request_id);
        decision
    }

    /// Drive one attached WebSocket until it closes.
    ///
    /// A second concurrent attach is rejected with a policy close frame; the
    /// existing client keeps the channel.
    pub async fn serve(&self, mut socket: WebSocket) {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        if !self.try_attach(tx) {
            warn!("rejecting second approval client");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "approval channel already open".into(),
                })))
                .await;
            return;
        }

        info!("approval client attached");

        loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(frame) => {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_response(&text),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("approval socket error: {e}");
                        break;
                    }
                },
                () = self.closed.cancelled() => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        self.detach();
        info!("approval client detached");
    }

    /// Detach the current client and fail every pending request.
    pub fn disconnect(&self) {
        self.closed.cancel();
        self.detach();
    }

    fn try_attach(&self, tx: mpsc::UnboundedSender<String>) -> bool {
        let mut slot = self.outbound.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(tx);
        true
    }

    fn detach(&self) {
        *self.outbound.lock() = None;
        // Dropping the senders resolves all awaiting requests as disconnected.
        self.pending.retain(|_, _| false);
    }

    fn handle_response(&self, text: &str) {
        let response: ApprovalResponse = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(e) => {
                warn!("ignoring malformed approval response: {e}");
                return;
            }
        };

        match self.pending.remove(&response.id) {
            Some((_, tx)) => {
                let _ = tx.send(response.result);
            }
            None => debug!(id = %response.id, "approval response for unknown request"),
        }
    }
}
