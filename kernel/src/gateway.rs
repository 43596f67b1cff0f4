//! Kernel gateway process supervisor.
//!
//! The gateway itself is an external Jupyter Kernel Gateway service; this
//! module owns its process: spawn with an injected environment, wait for the
//! HTTP admin surface to come up, and tear it down on shutdown. Sandbox
//! enforcement is delegated to a wrapper command prepended to the launch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{KernelError, KernelResult};

/// Kernel gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelGatewayConfig {
    pub host: String,
    pub port: u16,
    /// Gateway launcher command.
    pub command: String,
    pub args: Vec<String>,
    /// Launch through the sandbox wrapper.
    pub sandbox: bool,
    /// Profile file handed to the sandbox wrapper.
    pub sandbox_config: Option<PathBuf>,
    /// Environment injected into the gateway child process. Kernels spawned
    /// by the gateway inherit it.
    pub env: HashMap<String, String>,
    pub log_level: String,
    pub ready_checks: usize,
    pub ready_check_interval: f64,
}

impl Default for KernelGatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
            command: "jupyter".to_string(),
            args: vec!["kernelgateway".to_string()],
            sandbox: false,
            sandbox_config: None,
            env: HashMap::new(),
            log_level: "INFO".to_string(),
            ready_checks: 50,
            ready_check_interval: 0.2,
        }
    }
}

/// Assemble the launch command line for a gateway config.
pub(crate) fn launch_command(config: &KernelGatewayConfig) -> (String, Vec<String>) {
    let mut gateway_args = config.args.clone();
    gateway_args.push(format!("--KernelGatewayApp.ip={}", config.host));
    gateway_args.push(format!("--KernelGatewayApp.port={}", config.port));
    gateway_args.push("--KernelGatewayApp.port_retries=0".to_string());
    gateway_args.push(format!(
        "--KernelGatewayApp.log_level={}",
        config.log_level.to_uppercase()
    ));

    if config.sandbox {
        let mut args = Vec::new();
        if let Some(profile) = &config.sandbox_config {
            args.push("-f".to_string());
            args.push(profile.display().to_string());
        }
        args.push(config.command.clone());
        args.extend(gateway_args);
        ("sandbox-exec".to_string(), args)
    } else {
        (config.command.clone(), gateway_args)
    }
}

/// A running kernel gateway process.
pub struct KernelGateway {
    config: KernelGatewayConfig,
    child: tokio::process::Child,
}

impl KernelGateway {
    /// Spawn the gateway and wait for its admin surface to answer.
    pub async fn start(config: KernelGatewayConfig) -> KernelResult<Self> {
        let (program, args) = launch_command(&config);
        debug!("launching kernel gateway: {program} {args:?}");

        let child = tokio::process::Command::new(&program)
            .args(&args)
            .envs(&config.env)
            .stdin(std::process::Stdio::null())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(KernelError::GatewaySpawn)?;

        let mut gateway = Self { config, child };
        if let Err(e) = gateway.wait_ready().await {
            let _ = gateway.child.kill().await;
            return Err(e);
        }

        info!("kernel gateway ready at {}", gateway.base_url());
        Ok(gateway)
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.config.host, self.config.port)
    }

    /// Kill the gateway process and reap it.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("failed to kill kernel gateway: {e}");
        }
        info!("kernel gateway stopped");
    }

    async fn wait_ready(&mut self) -> KernelResult<()> {
        let url = format!("{}/api/kernels", self.base_url());
        let interval = Duration::from_secs_f64(self.config.ready_check_interval);
        let http = reqwest::Client::new();

        for _ in 0..self.config.ready_checks {
            if let Ok(Some(status)) = self.child.try_wait() {
                warn!("kernel gateway exited during startup: {status}");
                break;
            }
            match http.get(&url).send().await {
                Ok(response) if response.status().is_success() => return Ok(()),
                _ => tokio::time::sleep(interval).await,
            }
        }
        Err(KernelError::GatewayNotReady(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = KernelGatewayConfig::default();
        assert_eq!(config.command, "jupyter");
        assert_eq!(config.args, vec!["kernelgateway"]);
        assert!(!config.sandbox);
        assert_eq!(config.ready_checks, 50);
    }

    #[test]
    fn test_launch_command_plain() {
        let config = KernelGatewayConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
            log_level: "debug".to_string(),
            ..Default::default()
        };
        let (program, args) = launch_command(&config);
        assert_eq!(program, "jupyter");
        assert_eq!(args[0], "kernelgateway");
        assert!(args.contains(&"--KernelGatewayApp.ip=127.0.0.1".to_string()));
        assert!(args.contains(&"--KernelGatewayApp.port=9000".to_string()));
        assert!(args.contains(&"--KernelGatewayApp.log_level=DEBUG".to_string()));
    }

    #[test]
    fn test_launch_command_sandboxed() {
        let config = KernelGatewayConfig {
            sandbox: true,
            sandbox_config: Some(PathBuf::from("/etc/profile.sb")),
            ..Default::default()
        };
        let (program, args) = launch_command(&config);
        assert_eq!(program, "sandbox-exec");
        assert_eq!(args[0], "-f");
        assert_eq!(args[1], "/etc/profile.sb");
        assert_eq!(args[2], "jupyter");
    }

    #[test]
    fn test_launch_command_sandbox_without_profile() {
        let config = KernelGatewayConfig {
            sandbox: true,
            ..Default::default()
        };
        let (program, args) = launch_command(&config);
        assert_eq!(program, "sandbox-exec");
        assert_eq!(args[0], "jupyter");
    }
}
