//! The execution coordinator facade.
//!
//! Composes the tool server, kernel gateway, and kernel client into one
//! scoped resource. Submissions are serialized against the kernel; each one
//! gets its own approval subscription and FIFO event queue.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use codebroker_kernel::{
    ExecutionResult, KernelClient, KernelClientConfig, KernelGateway,
};
use codebroker_mcp::{replace_variables, ProviderClient, ProviderParams, Substitution};
use codebroker_tool_server::{ApprovalClient, ApprovalClientError, ToolServer};

use crate::{
    budget::Budget,
    config::BrokerConfig,
    execution::{CodeExecution, ExecutionError, InterruptSlot, QueueItem},
};

/// Per-submission options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Pause-aware execution budget; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Emit `Chunk`/`Image` events as they arrive instead of collapsing
    /// them into the final result.
    pub stream: bool,
}

impl ExecuteOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn streaming() -> Self {
        Self {
            stream: true,
            ..Self::default()
        }
    }
}

type ClientSlot = Arc<Mutex<Option<Arc<KernelClient>>>>;

/// The code-execution broker.
///
/// Owns a tool server, optionally a kernel gateway process, and one kernel
/// client. [`shutdown`](Self::shutdown) releases them in reverse order.
pub struct CodeBroker {
    config: BrokerConfig,
    tool_server: ToolServer,
    gateway: Option<KernelGateway>,
    client: ClientSlot,
    /// Serializes executions and reset against the kernel.
    work_lock: Arc<Mutex<()>>,
    /// Provider params registered through the agent surface.
    providers: DashMap<String, Value>,
}

impl CodeBroker {
    /// Boot tool server, gateway, and kernel client, in that order.
    ///
    /// The tool server address is injected into the gateway's child kernel
    /// environment (together with `kernel_env`) so in-kernel code can reach
    /// the `/run` surface.
    pub async fn start(mut config: BrokerConfig) -> Result<Self, ExecutionError> {
        let tool_server = ToolServer::start(config.tool_server.clone())
            .await
            .map_err(|e| ExecutionError::Config(e.to_string()))?;

        config
            .gateway
            .env
            .insert("TOOL_SERVER_HOST".to_string(), tool_server.host());
        config
            .gateway
            .env
            .insert("TOOL_SERVER_PORT".to_string(), tool_server.port().to_string());
        config.gateway.env.extend(config.kernel_env.clone());

        let gateway = if config.spawn_gateway {
            match KernelGateway::start(config.gateway.clone()).await {
                Ok(gateway) => Some(gateway),
                Err(e) => {
                    tool_server.stop().await;
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        let client = match KernelClient::connect(kernel_config(&config)).await {
            Ok(client) => client,
            Err(e) => {
                if let Some(gateway) = gateway {
                    gateway.stop().await;
                }
                tool_server.stop().await;
                return Err(e.into());
            }
        };

        info!("code broker started");
        Ok(Self {
            config,
            tool_server,
            gateway,
            client: Arc::new(Mutex::new(Some(Arc::new(client)))),
            work_lock: Arc::new(Mutex::new(())),
            providers: DashMap::new(),
        })
    }

    pub fn tool_server(&self) -> &ToolServer {
        &self.tool_server
    }

    /// Submit code, returning the merged event stream for it.
    ///
    /// Submissions queue FIFO behind any in-flight execution or reset; the
    /// budget runs from submission time.
    pub async fn execute(&self, code: &str, options: ExecuteOptions) -> CodeExecution {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let budget = Budget::new(options.timeout, queue_rx);
        let interrupt: InterruptSlot = Arc::new(parking_lot::Mutex::new(None));

        let worker = ExecutionWorker {
            code: code.to_string(),
            queue: queue_tx,
            interrupt: Arc::clone(&interrupt),
            client: Arc::clone(&self.client),
            work_lock: Arc::clone(&self.work_lock),
            approval_host: self.tool_server.host(),
            approval_port: self.tool_server.port(),
        };
        tokio::spawn(worker.run());

        CodeExecution::new(budget, interrupt, options.stream)
    }

    /// Submit with default options (no deadline, chunks collapsed).
    pub async fn submit(&self, code: &str) -> CodeExecution {
        self.execute(code, ExecuteOptions::default()).await
    }

    /// Close and reopen the kernel, and flush all tool provider bindings.
    ///
    /// Serializes against in-flight executions: it waits for them rather
    /// than cancelling.
    pub async fn reset(&self) -> Result<(), ExecutionError> {
        let _work = self.work_lock.lock().await;

        codebroker_tool_server::reset(&self.tool_server.host(), self.tool_server.port())
            .await
            .map_err(|e| ExecutionError::Transport(format!("tool server reset: {e}")))?;

        let mut slot = self.client.lock().await;
        if let Some(old) = slot.take() {
            match Arc::try_unwrap(old) {
                Ok(client) => client.disconnect().await,
                Err(_) => warn!("kernel client still referenced at reset; leaking old session"),
            }
        }

        let client = KernelClient::connect(kernel_config(&self.config)).await?;
        *slot = Some(Arc::new(client));
        info!("broker reset complete");
        Ok(())
    }

    /// Release kernel, gateway, and tool server, in reverse start order.
    pub async fn shutdown(self) {
        let work_lock = Arc::clone(&self.work_lock);
        let _work = work_lock.lock().await;

        if let Some(client) = self.client.lock().await.take() {
            match Arc::try_unwrap(client) {
                Ok(client) => client.disconnect().await,
                Err(_) => warn!("kernel client still referenced at shutdown"),
            }
        }
        if let Some(gateway) = self.gateway {
            gateway.stop().await;
        }
        self.tool_server.stop().await;
        info!("code broker stopped");
    }

    // --- Agent-surface operations ---

    /// Execute code and render the result as markdown (output text plus
    /// links to generated images).
    ///
    /// Intended for non-interactive callers; approval requests encountered
    /// here are rejected.
    pub async fn execute_code(
        &self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<String, ExecutionError> {
        let mut execution = self
            .execute(
                code,
                ExecuteOptions {
                    timeout,
                    stream: false,
                },
            )
            .await;
        let result = execution.result().await?;
        Ok(render_markdown(&result))
    }

    /// Install a package into the kernel's environment via pip.
    pub async fn install_package(&self, package_name: &str) -> Result<String, ExecutionError> {
        let code = format!("%pip install --no-input {package_name}");
        self.execute_code(&code, None).await
    }

    /// Register a tool provider's params under `name`.
    ///
    /// `${VAR}` placeholders are substituted from the broker's environment;
    /// the substitution report (including variables left unresolved) is
    /// returned for the caller to act on. Re-registering a name overwrites
    /// the previous params.
    pub fn register_tool_provider(
        &self,
        name: &str,
        params: &Value,
    ) -> Result<Substitution, ExecutionError> {
        register_provider(&self.providers, name, params)
    }

    /// Connect to a registered provider and list its tool names.
    ///
    /// Used by registration façades to expose the catalog right after
    /// [`register_tool_provider`](Self::register_tool_provider). The probe
    /// connection is closed before returning; the tool server builds its own
    /// binding on first `/run`.
    pub async fn list_provider_tools(&self, name: &str) -> Result<Vec<String>, ExecutionError> {
        let params = self
            .tool_provider_params(name)
            .ok_or_else(|| ExecutionError::Config(format!("unknown tool provider '{name}'")))?;
        let params = ProviderParams::from_value(&params)
            .map_err(|e| ExecutionError::Config(e.to_string()))?;

        let connect_timeout = Duration::from_secs_f64(self.config.tool_server.connect_timeout);
        let client = ProviderClient::connect(name, &params, connect_timeout)
            .await
            .map_err(|e| ExecutionError::Config(e.to_string()))?;

        let tools = client
            .list_tools()
            .await
            .map_err(|e| ExecutionError::Config(e.to_string()))?;
        let names = tools.into_iter().map(|tool| tool.name.into_owned()).collect();

        if let Err(e) = client.close().await {
            warn!("error closing probe connection to '{name}': {e}");
        }
        Ok(names)
    }

    /// Params previously registered under `name`.
    pub fn tool_provider_params(&self, name: &str) -> Option<Value> {
        self.providers.get(name).map(|entry| entry.value().clone())
    }

    /// Names of all registered tool providers.
    pub fn registered_providers(&self) -> Vec<String> {
        self.providers.iter().map(|entry| entry.key().clone()).collect()
    }
}

fn kernel_config(config: &BrokerConfig) -> KernelClientConfig {
    let mut kernel = config.kernel.clone();
    kernel.host = config.gateway.host.clone();
    kernel.port = config.gateway.port;
    kernel
}

fn register_provider(
    providers: &DashMap<String, Value>,
    name: &str,
    params: &Value,
) -> Result<Substitution, ExecutionError> {
    let substitution = replace_variables(params, &std::env::vars().collect());
    ProviderParams::from_value(&substitution.replaced)
        .map_err(|e| ExecutionError::Config(e.to_string()))?;

    providers.insert(name.to_string(), substitution.replaced.clone());
    info!(provider = name, "registered tool provider");
    Ok(substitution)
}

/// Render an execution result for agent-facing RPC surfaces.
fn render_markdown(result: &ExecutionResult) -> String {
    let mut output = result.text.clone().unwrap_or_default();
    if !result.images.is_empty() {
        output.push_str("\n\nGenerated images:\n\n");
        for path in &result.images {
            let stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let absolute = path
                .canonicalize()
                .unwrap_or_else(|_| path.clone());
            output.push_str(&format!("- [{stem}]({})\n", absolute.display()));
        }
    }
    output
}

/// Runs one execution to completion: attaches the approval subscription,
/// drives the kernel stream, and enqueues the terminal event.
struct ExecutionWorker {
    code: String,
    queue: mpsc::UnboundedSender<QueueItem>,
    interrupt: InterruptSlot,
    client: ClientSlot,
    work_lock: Arc<Mutex<()>>,
    approval_host: String,
    approval_port: u16,
}

impl ExecutionWorker {
    /// How long to keep retrying an attach the server rejected because the
    /// previous execution's client is still detaching.
    const ATTACH_RETRIES: usize = 50;
    const ATTACH_RETRY_INTERVAL: Duration = Duration::from_millis(20);

    async fn run(self) {
        let _work = self.work_lock.lock().await;

        let client = match self.client.lock().await.as_ref() {
            Some(client) => Arc::clone(client),
            None => {
                let _ = self.queue.send(QueueItem::Failed(ExecutionError::Transport(
                    "broker has no kernel client".to_string(),
                )));
                return;
            }
        };
        *self.interrupt.lock() = Some(client.interrupt_handle());

        let approval_client = match self.attach_approval_client().await {
            Ok(client) => client,
            Err(e) => {
                let _ = self
                    .queue
                    .send(QueueItem::Failed(ExecutionError::Approval(e.to_string())));
                return;
            }
        };

        // The caller can drop its execution handle at any point, including
        // while the kernel is blocked in a tool call and emitting nothing;
        // closure of the event queue is the only signal then, so race the
        // stream against it and free the kernel.
        tokio::select! {
            () = self.stream_kernel(&client) => {}
            () = self.queue.closed() => {
                debug!("execution consumer gone; interrupting kernel");
                client.interrupt().await;
            }
        }

        approval_client.disconnect().await;
    }

    /// Attach this execution's approval subscription.
    ///
    /// Approval requests land on the same queue as kernel output; the
    /// callback holds only a queue sender, so a dropped execution handle
    /// releases everything. The server rejects an attach while the previous
    /// execution's client is still mid-detach, so that outcome is retried.
    async fn attach_approval_client(&self) -> Result<ApprovalClient, ApprovalClientError> {
        let mut attempt = 0;
        loop {
            let approval_queue = self.queue.clone();
            let connected = ApprovalClient::connect(
                &self.approval_host,
                self.approval_port,
                Box::new(move |request| {
                    let _ = approval_queue.send(QueueItem::Approval(request));
                }),
            )
            .await;

            match connected {
                Err(ApprovalClientError::Rejected) if attempt + 1 < Self::ATTACH_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Self::ATTACH_RETRY_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    async fn stream_kernel(&self, client: &KernelClient) {
        let mut execution = match client.submit(&self.code).await {
            Ok(execution) => execution,
            Err(e) => {
                let _ = self.queue.send(QueueItem::Failed(e.into()));
                return;
            }
        };

        loop {
            match execution.next_output().await {
                Ok(Some(event)) => {
                    if self.queue.send(QueueItem::Output(event)).is_err() {
                        // Caller dropped the stream; stop the kernel and bail.
                        debug!("execution consumer gone; interrupting kernel");
                        client.interrupt().await;
                        return;
                    }
                }
                Ok(None) => {
                    let result = execution.completed_result().unwrap_or_default();
                    let _ = self.queue.send(QueueItem::Done(result));
                    return;
                }
                Err(e) => {
                    let _ = self.queue.send(QueueItem::Failed(e.into()));
                    return;
                }
            }
        }
    }
}
