//! Aggregate broker configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use codebroker_kernel::{KernelClientConfig, KernelGatewayConfig};
use codebroker_tool_server::ToolServerConfig;

/// Configuration for one broker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub tool_server: ToolServerConfig,
    pub gateway: KernelGatewayConfig,
    pub kernel: KernelClientConfig,
    /// Extra environment injected into the gateway's child kernels.
    pub kernel_env: HashMap<String, String>,
    /// When false, attach to an already-running gateway instead of
    /// spawning one.
    pub spawn_gateway: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            tool_server: ToolServerConfig::default(),
            gateway: KernelGatewayConfig::default(),
            kernel: KernelClientConfig::default(),
            kernel_env: HashMap::new(),
            spawn_gateway: true,
        }
    }
}

impl BrokerConfig {
    /// Config with both servers on ephemeral ports, suitable for running
    /// several brokers side by side.
    pub fn ephemeral() -> std::io::Result<Self> {
        let mut config = Self::default();
        config.tool_server.port = 0;
        config.gateway.port = pick_free_port()?;
        config.kernel.port = config.gateway.port;
        Ok(config)
    }
}

/// Bind port 0 and return the allocated port.
///
/// The listener is dropped before returning, so the port can race with
/// other processes; callers that can pass port 0 directly should.
pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
