use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use codebroker::{BrokerConfig, CodeBroker, ExecutionEvent};
use codebroker_tool_server::{ToolServer, ToolServerConfig};

#[derive(Parser)]
#[command(name = "codebroker", version, about = "Code-execution broker with approval-gated tool calls")]
struct Cli {
    /// Log filter, e.g. "info" or "codebroker=debug".
    #[arg(long, env = "CODEBROKER_LOG", default_value = "info", global = true)]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the approval-gated tool server standalone.
    ToolServer {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8900)]
        port: u16,
        /// Gate tool calls on the approval channel.
        #[arg(long)]
        approval_required: bool,
        /// Per-request approval timeout in seconds.
        #[arg(long)]
        approval_timeout: Option<f64>,
        /// Provider connect timeout in seconds.
        #[arg(long, default_value_t = 10.0)]
        connect_timeout: f64,
    },

    /// Execute a code file through a freshly started broker.
    Run {
        /// File containing the code to execute.
        file: PathBuf,
        /// Execution budget in seconds (excludes approval waits).
        #[arg(long)]
        timeout: Option<f64>,
        /// Print output chunks as they arrive.
        #[arg(long)]
        stream: bool,
        /// Approve every tool call instead of rejecting.
        #[arg(long)]
        approve_all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).context("invalid log filter")?)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::ToolServer {
            host,
            port,
            approval_required,
            approval_timeout,
            connect_timeout,
        } => {
            let config = ToolServerConfig {
                host,
                port,
                approval_required,
                approval_timeout,
                connect_timeout,
                log_level: cli.log,
            };
            let server = ToolServer::start(config).await?;
            println!("tool server listening on {}", server.addr());
            tokio::signal::ctrl_c().await?;
            server.stop().await;
        }

        Command::Run {
            file,
            timeout,
            stream,
            approve_all,
        } => {
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;

            let mut config = BrokerConfig::ephemeral()?;
            config.tool_server.approval_required = approve_all;
            let broker = CodeBroker::start(config).await?;

            let options = codebroker::ExecuteOptions {
                timeout: timeout.map(Duration::from_secs_f64),
                stream,
            };
            let mut execution = broker.execute(&code, options).await;

            let outcome = loop {
                match execution.next_event().await {
                    Ok(Some(ExecutionEvent::Approval(request))) => {
                        eprintln!("approval request: {request}");
                        if approve_all {
                            request.approve().await?;
                        } else {
                            request.reject().await?;
                        }
                    }
                    Ok(Some(ExecutionEvent::Chunk(text))) => print!("{text}"),
                    Ok(Some(ExecutionEvent::Image(path))) => {
                        eprintln!("image: {}", path.display());
                    }
                    Ok(Some(ExecutionEvent::Result(result))) => {
                        if !stream {
                            if let Some(text) = &result.text {
                                println!("{text}");
                            }
                        }
                        for image in &result.images {
                            eprintln!("image: {}", image.display());
                        }
                        break Ok(());
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(anyhow::anyhow!(e)),
                }
            };

            broker.shutdown().await;
            outcome?;
        }
    }

    Ok(())
}
