//! The tool server: HTTP surface, binding cache, and run pipeline.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use codebroker_mcp::{replace_variables, ProviderClient, ProviderParams};

use crate::{
    approval::ApprovalChannel,
    error::{ApprovalError, ToolServerError},
};

const READY_CHECKS: usize = 50;
const READY_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// Tool server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolServerConfig {
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    pub approval_required: bool,
    /// Per-request approval timeout in seconds; `None` waits indefinitely.
    pub approval_timeout: Option<f64>,
    /// Provider connect timeout in seconds.
    pub connect_timeout: f64,
    pub log_level: String,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8900,
            approval_required: false,
            approval_timeout: Some(60.0),
            connect_timeout: 10.0,
            log_level: "info".to_string(),
        }
    }
}

/// Body of `POST /run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRunRequest {
    pub server_name: String,
    pub server_params: Value,
    pub tool: String,
    pub arguments: Map<String, Value>,
}

struct ServerState {
    approval: ApprovalChannel,
    bindings: Mutex<HashMap<String, Arc<ProviderClient>>>,
    connect_timeout: Duration,
}

impl ServerState {
    fn new(config: &ToolServerConfig) -> Self {
        Self {
            approval: ApprovalChannel::new(
                config.approval_required,
                config.approval_timeout.map(Duration::from_secs_f64),
            ),
            bindings: Mutex::new(HashMap::new()),
            connect_timeout: Duration::from_secs_f64(config.connect_timeout),
        }
    }

    /// Get the cached provider for `server_name`, connecting on first use.
    ///
    /// The lock is held across the connect so that concurrent `/run` calls
    /// for the same provider share one connection attempt.
    async fn provider(
        &self,
        server_name: &str,
        server_params: &Value,
    ) -> Result<Arc<ProviderClient>, ToolServerError> {
        let mut bindings = self.bindings.lock().await;
        if let Some(client) = bindings.get(server_name) {
            return Ok(Arc::clone(client));
        }

        let substitution = replace_variables(server_params, &std::env::vars().collect());
        if !substitution.missing_variables.is_empty() {
            warn!(
                server_name,
                missing = ?substitution.missing_variables,
                "unresolved placeholders in provider params"
            );
        }

        let params = ProviderParams::from_value(&substitution.replaced)?;
        let client =
            Arc::new(ProviderClient::connect(server_name, &params, self.connect_timeout).await?);
        bindings.insert(server_name.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Close and clear all provider bindings.
    async fn close_bindings(&self) {
        let mut bindings = self.bindings.lock().await;
        for (name, client) in bindings.drain() {
            match Arc::try_unwrap(client) {
                Ok(client) => {
                    if let Err(e) = client.close().await {
                        warn!("error closing provider '{name}': {e}");
                    }
                }
                // An in-flight run still holds the client; it is torn down
                // when the last reference drops.
                Err(_) => warn!("provider '{name}' still in use at reset; dropping binding"),
            }
        }
    }
}

async fn status() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn reset_handler(State(state): State<Arc<ServerState>>) -> Json<Value> {
    state.close_bindings().await;
    info!("tool provider bindings cleared");
    Json(json!({"reset": "success"}))
}

async fn run_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ToolRunRequest>,
) -> Json<Value> {
    let target = format!("{}.{}", request.server_name, request.tool);

    match state
        .approval
        .request(&request.server_name, &request.tool, &request.arguments)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return Json(json!({"error": format!("Approval request for {target} denied")}));
        }
        Err(ApprovalError::Expired) => {
            return Json(json!({"error": format!("Approval request for {target} expired")}));
        }
        Err(e) => {
            return Json(json!({"error": format!("Approval request for {target} failed: {e}")}));
        }
    }

    let result = async {
        let provider = state
            .provider(&request.server_name, &request.server_params)
            .await?;
        provider
            .run(&request.tool, request.arguments.clone())
            .await
            .map_err(ToolServerError::from)
    }
    .await;

    match result {
        Ok(value) => Json(json!({"result": value})),
        Err(e) => {
            error!("tool run {target} failed: {e}");
            Json(json!({"error": e.to_string()}))
        }
    }
}

async fn approval_handler(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| async move { state.approval.serve(socket).await })
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/reset", put(reset_handler))
        .route("/run", post(run_handler))
        .route("/approval", get(approval_handler))
        .with_state(state)
}

/// A running tool server bound to one address.
pub struct ToolServer {
    state: Arc<ServerState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl ToolServer {
    /// Bind, serve, and wait for the `/status` probe to succeed.
    pub async fn start(config: ToolServerConfig) -> Result<Self, ToolServerError> {
        let state = Arc::new(ServerState::new(&config));
        let app = router(Arc::clone(&state));

        let bind_addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ToolServerError::Bind {
                addr: bind_addr,
                source,
            })?;
        let addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let serve_token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("tool server exited with error: {e}");
            }
        });

        let server = Self {
            state,
            addr,
            shutdown,
            task,
        };
        server.wait_ready().await?;
        info!("tool server listening on {}", server.addr);
        Ok(server)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Whether an approval client is attached right now.
    pub fn approval_open(&self) -> bool {
        self.state.approval.is_open()
    }

    /// Close bindings, detach the approval client, and stop serving.
    pub async fn stop(self) {
        self.state.close_bindings().await;
        self.state.approval.disconnect();
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("tool server task join error: {e}");
        }
    }

    async fn wait_ready(&self) -> Result<(), ToolServerError> {
        let url = format!("http://{}/status", self.addr);
        let client = reqwest::Client::new();

        for _ in 0..READY_CHECKS {
            match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                _ => tokio::time::sleep(READY_CHECK_INTERVAL).await,
            }
        }
        Err(ToolServerError::NotReady(url))
    }
}
