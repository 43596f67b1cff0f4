//! Client for executing code in one interpreter kernel.
//!
//! Connects to a kernel gateway, creates a kernel, and drives its channels
//! WebSocket. Code execution is stateful: definitions and variables from
//! previous executions are visible to subsequent ones.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{KernelError, KernelResult},
    execution::{Execution, Interrupter, RouteGuard},
    wire::KernelMessage,
};

const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Kernel client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelClientConfig {
    pub host: String,
    pub port: u16,
    /// Directory for images generated during execution.
    pub images_dir: PathBuf,
    /// WebSocket ping interval in seconds; `0` disables the heartbeat.
    pub heartbeat_interval: f64,
    /// Kernel creation retries while the gateway starts up.
    pub connect_retries: usize,
    /// Delay between kernel creation retries in seconds.
    pub connect_retry_interval: f64,
}

impl Default for KernelClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            images_dir: PathBuf::from("images"),
            heartbeat_interval: 10.0,
            connect_retries: 10,
            connect_retry_interval: 1.0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KernelInfo {
    id: String,
}

type Routes = Arc<DashMap<String, mpsc::UnboundedSender<KernelMessage>>>;

/// A connected kernel session.
///
/// At most one execution is in flight per client; a second `submit` while
/// one is active fails with [`KernelError::Busy`].
#[derive(Debug)]
pub struct KernelClient {
    config: KernelClientConfig,
    http: reqwest::Client,
    session_id: String,
    kernel_id: String,
    routes: Routes,
    out_tx: mpsc::UnboundedSender<Message>,
    shutdown: CancellationToken,
    reader: tokio::task::JoinHandle<()>,
    writer: tokio::task::JoinHandle<()>,
}

impl KernelClient {
    /// Create a kernel and connect to its message channel.
    ///
    /// Kernel creation is retried while the gateway starts up. After the
    /// channel opens, the kernel is initialized with a no-color directive so
    /// tracebacks carry no ANSI escapes.
    pub async fn connect(config: KernelClientConfig) -> KernelResult<Self> {
        let http = reqwest::Client::new();
        let session_id = Uuid::new_v4().simple().to_string();

        let kernel_id = Self::create_kernel(&http, &config).await?;
        let ws_url = format!(
            "ws://{}:{}/api/kernels/{}/channels?session_id={}",
            config.host, config.port, kernel_id, session_id
        );

        let (stream, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .map_err(|e| KernelError::WebSocket(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let routes: Routes = Arc::new(DashMap::new());
        let last_seen = Arc::new(Mutex::new(Instant::now()));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let shutdown = CancellationToken::new();

        let reader = {
            let routes = Arc::clone(&routes);
            let last_seen = Arc::clone(&last_seen);
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            *last_seen.lock() = Instant::now();
                            match serde_json::from_str::<KernelMessage>(&text) {
                                Ok(message) => {
                                    let parent = message.parent_msg_id().map(str::to_string);
                                    if let Some(parent) = parent {
                                        if let Some(route) = routes.get(&parent) {
                                            let _ = route.send(message);
                                        }
                                    }
                                }
                                Err(e) => debug!("ignoring unparseable kernel frame: {e}"),
                            }
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                            *last_seen.lock() = Instant::now();
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                // Dropping the routes fails any in-flight execution.
                routes.clear();
                debug!("kernel reader finished");
            })
        };

        let writer = {
            let routes = Arc::clone(&routes);
            let last_seen = Arc::clone(&last_seen);
            let shutdown = shutdown.clone();
            let heartbeat = (config.heartbeat_interval > 0.0)
                .then(|| Duration::from_secs_f64(config.heartbeat_interval));
            tokio::spawn(async move {
                let mut ping =
                    tokio::time::interval(heartbeat.unwrap_or(Duration::from_secs(3600)));
                ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ping.tick().await; // first tick is immediate

                loop {
                    tokio::select! {
                        outgoing = out_rx.recv() => match outgoing {
                            Some(message) => {
                                if sink.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                        _ = ping.tick() => {
                            let Some(interval) = heartbeat else { continue };
                            if last_seen.lock().elapsed() > interval * 2 {
                                warn!("kernel heartbeat missed; closing connection");
                                break;
                            }
                            if sink.send(Message::Ping(Vec::new())).await.is_err() {
                                break;
                            }
                        }
                        () = shutdown.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                let _ = sink.close().await;
                routes.clear();
                debug!("kernel writer finished");
            })
        };

        let client = Self {
            config,
            http,
            session_id,
            kernel_id,
            routes,
            out_tx,
            shutdown,
            reader,
            writer,
        };

        info!(kernel_id = %client.kernel_id, "connected to kernel");
        client.init_kernel().await?;
        Ok(client)
    }

    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    /// Execute code and wait for the complete result.
    pub async fn execute(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> KernelResult<crate::execution::ExecutionResult> {
        let execution = self.submit(code).await?;
        execution.result(timeout).await
    }

    /// Submit code for execution, returning immediately with a handle for
    /// consuming its output stream.
    pub async fn submit(&self, code: &str) -> KernelResult<Execution> {
        if !self.routes.is_empty() {
            return Err(KernelError::Busy);
        }

        let request_id = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(request_id.clone(), tx);
        let guard = RouteGuard {
            routes: Arc::clone(&self.routes),
            request_id: request_id.clone(),
        };

        let frame = KernelMessage::execute_request(&self.session_id, &request_id, code);
        let text = serde_json::to_string(&frame)
            .map_err(|e| KernelError::WebSocket(format!("encode execute_request: {e}")))?;
        self.out_tx
            .send(Message::Text(text))
            .map_err(|_| KernelError::NotConnected)?;

        debug!(%request_id, "submitted execute_request");
        Ok(Execution::new(
            request_id,
            rx,
            self.config.images_dir.clone(),
            self.interrupt_handle(),
            Some(guard),
        ))
    }

    /// Interrupt the running kernel. Best-effort; the kernel reaches a
    /// re-executable state afterwards.
    pub async fn interrupt(&self) {
        self.interrupt_handle().interrupt().await;
    }

    /// A detached handle for interrupting this kernel.
    pub fn interrupt_handle(&self) -> Interrupter {
        Interrupter {
            http: self.http.clone(),
            url: format!("{}/interrupt", self.kernel_http_url()),
        }
    }

    /// Close the channel and delete the kernel.
    pub async fn disconnect(self) {
        let kernel_http_url = self.kernel_http_url();
        self.shutdown.cancel();
        let _ = self.writer.await;
        self.reader.abort();
        let _ = self.reader.await;

        if let Err(e) = self.http.delete(kernel_http_url).send().await {
            debug!("kernel delete failed: {e}");
        }
        info!(kernel_id = %self.kernel_id, "disconnected from kernel");
    }

    async fn create_kernel(http: &reqwest::Client, config: &KernelClientConfig) -> KernelResult<String> {
        let url = format!("http://{}:{}/api/kernels", config.host, config.port);
        let retry_interval = Duration::from_secs_f64(config.connect_retry_interval);

        for _ in 0..config.connect_retries {
            let created = async {
                http.post(&url)
                    .json(&serde_json::json!({"name": "python"}))
                    .send()
                    .await?
                    .error_for_status()?
                    .json::<KernelInfo>()
                    .await
            }
            .await;

            match created {
                Ok(info) => return Ok(info.id),
                Err(e) => {
                    debug!("kernel creation failed, retrying: {e}");
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
        Err(KernelError::CreateKernel(config.connect_retries))
    }

    async fn init_kernel(&self) -> KernelResult<()> {
        self.execute("%colors nocolor", Some(INIT_TIMEOUT)).await?;
        Ok(())
    }

    fn kernel_http_url(&self) -> String {
        format!(
            "http://{}:{}/api/kernels/{}",
            self.config.host, self.config.port, self.kernel_id
        )
    }
}
