//! One code execution and its reconstructed result.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    error::{KernelError, KernelResult},
    wire::KernelMessage,
};

/// Grace period after an interrupt before the timeout is surfaced, giving
/// the kernel time to settle into a re-executable state.
pub(crate) const INTERRUPT_GRACE: Duration = Duration::from_millis(200);

/// An output element produced while code is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A text fragment from stdout/stderr or a rendered text/plain value.
    Chunk(String),
    /// Path to an image written to the images directory.
    Image(PathBuf),
}

/// The result of a successful code execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Output text, trailing whitespace trimmed; `None` if nothing printed.
    pub text: Option<String>,
    /// Paths of images generated during execution, in print order.
    pub images: Vec<PathBuf>,
}

/// Best-effort kernel interrupt handle, used when a deadline expires.
#[derive(Clone, Debug)]
pub struct Interrupter {
    pub(crate) http: reqwest::Client,
    pub(crate) url: String,
}

impl Interrupter {
    /// Interrupt the kernel and wait the settle grace period.
    pub async fn interrupt(&self) {
        match self.http.post(&self.url).send().await {
            Ok(response) => info!("kernel interrupted: {}", response.status()),
            Err(e) => debug!("kernel interrupt failed: {e}"),
        }
        tokio::time::sleep(INTERRUPT_GRACE).await;
    }
}

/// Unregisters the execution's demux route when dropped.
#[derive(Debug)]
pub(crate) struct RouteGuard {
    pub(crate) routes: Arc<DashMap<String, mpsc::UnboundedSender<KernelMessage>>>,
    pub(crate) request_id: String,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        self.routes.remove(&self.request_id);
    }
}

/// An ongoing or completed code execution.
///
/// Created by `KernelClient::submit`. The output stream is single-consumer;
/// once it has been drained, [`result`](Execution::result) returns the
/// accumulated values without re-reading.
#[derive(Debug)]
pub struct Execution {
    request_id: String,
    messages: mpsc::UnboundedReceiver<KernelMessage>,
    images_dir: PathBuf,
    interrupter: Interrupter,
    _route: Option<RouteGuard>,

    queued: VecDeque<OutputEvent>,
    chunks: Vec<String>,
    images: Vec<PathBuf>,
    pending_error: Option<KernelError>,
    finished: bool,
}

impl Execution {
    pub(crate) fn new(
        request_id: String,
        messages: mpsc::UnboundedReceiver<KernelMessage>,
        images_dir: PathBuf,
        interrupter: Interrupter,
        route: Option<RouteGuard>,
    ) -> Self {
        Self {
            request_id,
            messages,
            images_dir,
            interrupter,
            _route: route,
            queued: VecDeque::new(),
            chunks: Vec::new(),
            images: Vec::new(),
            pending_error: None,
            finished: false,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next output element, or `None` when the execution completed cleanly.
    ///
    /// Raises the kernel's error when the code raised, and `Disconnected`
    /// when the channel went away mid-execution.
    pub async fn next_output(&mut self) -> KernelResult<Option<OutputEvent>> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                match &event {
                    OutputEvent::Chunk(text) => self.chunks.push(text.clone()),
                    OutputEvent::Image(path) => self.images.push(path.clone()),
                }
                return Ok(Some(event));
            }

            if self.finished {
                return Ok(None);
            }

            let message = self
                .messages
                .recv()
                .await
                .ok_or(KernelError::Disconnected)?;
            self.classify(message).await?;
        }
    }

    /// Wait for the execution to complete and return the accumulated result.
    ///
    /// On timeout the kernel is interrupted and, after a short grace period,
    /// [`KernelError::Timeout`] is surfaced; variables assigned before the
    /// interrupt remain observable by subsequent executions.
    pub async fn result(mut self, timeout: Option<Duration>) -> KernelResult<ExecutionResult> {
        match timeout {
            None => self.drain().await?,
            Some(limit) => match tokio::time::timeout(limit, self.drain()).await {
                Ok(drained) => drained?,
                Err(_) => {
                    self.interrupter.interrupt().await;
                    return Err(KernelError::Timeout(limit));
                }
            },
        }
        Ok(self.finish_result())
    }

    /// The accumulated result, available once the stream completed cleanly.
    pub fn completed_result(&self) -> Option<ExecutionResult> {
        self.finished.then(|| self.finish_result())
    }

    async fn drain(&mut self) -> KernelResult<()> {
        while self.next_output().await?.is_some() {}
        Ok(())
    }

    fn finish_result(&self) -> ExecutionResult {
        let text = self.chunks.concat();
        let text = text.trim_end();
        ExecutionResult {
            text: if text.is_empty() {
                None
            } else {
                Some(text.to_string())
            },
            images: self.images.clone(),
        }
    }

    async fn classify(&mut self, message: KernelMessage) -> KernelResult<()> {
        match message.msg_type() {
            "stream" => {
                if let Some(text) = message.content["text"].as_str() {
                    self.queued.push_back(OutputEvent::Chunk(text.to_string()));
                }
            }

            "error" => {
                self.pending_error = Some(execution_error(&message.content));
            }

            "execute_reply" => {
                self.finished = true;
                if message.content["status"] == "error" {
                    let error = self
                        .pending_error
                        .take()
                        .unwrap_or_else(|| execution_error(&message.content));
                    return Err(error);
                }
            }

            "execute_result" | "display_data" => {
                let data = &message.content["data"];
                if let Some(text) = data["text/plain"].as_str() {
                    self.queued.push_back(OutputEvent::Chunk(text.to_string()));
                }
                if let Some(encoded) = data["image/png"].as_str() {
                    let path = self.write_image(encoded).await?;
                    self.queued.push_back(OutputEvent::Image(path));
                }
            }

            _ => {}
        }
        Ok(())
    }

    async fn write_image(&self, encoded: &str) -> KernelResult<PathBuf> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.replace(['\n', '\r'], ""))
            .map_err(|e| KernelError::WebSocket(format!("bad image payload: {e}")))?;

        tokio::fs::create_dir_all(&self.images_dir).await?;

        let image_id = Uuid::new_v4().simple().to_string();
        let path = self.images_dir.join(format!("{}.png", &image_id[..8]));
        tokio::fs::write(&path, bytes).await?;
        debug!("wrote image {}", path.display());
        Ok(path)
    }
}

/// Build an execution error from an `error` or failed `execute_reply`
/// content, with any stray ANSI escapes scrubbed.
fn execution_error(content: &Value) -> KernelError {
    let traceback = content["traceback"]
        .as_array()
        .map(|lines| {
            lines
                .iter()
                .filter_map(Value::as_str)
                .map(strip_ansi)
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    KernelError::Execution {
        name: content["ename"].as_str().unwrap_or("Unknown Error").to_string(),
        value: strip_ansi(content["evalue"].as_str().unwrap_or_default()),
        traceback,
    }
}

/// Remove ANSI escape sequences.
///
/// The kernel is initialized with a no-color directive, so this is a
/// backstop for output produced before that directive takes effect.
pub(crate) fn strip_ansi(input: &str) -> String {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| regex::Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap())
        .replace_all(input, "")
        .into_owned()
}
