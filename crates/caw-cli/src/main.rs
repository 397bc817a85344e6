mod env;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use caw_core::daemon::{Daemon, Role};
use caw_core::rpc::stdio;
use caw_core::spawner::launcher::ClaudeCodeLauncher;
use caw_db::pool;

use env::Transport;

#[derive(Parser)]
#[command(name = "caw", about = "Workflow orchestration daemon for fleets of LLM coding agents")]
struct Cli {
    /// Run the daemon (or join an existing one as a client).
    #[arg(long)]
    server: bool,

    /// RPC transport served in the foreground (overrides CAW_TRANSPORT).
    #[arg(long, value_parser = env::parse_transport)]
    transport: Option<Transport>,

    /// HTTP port (overrides CAW_PORT).
    #[arg(long, value_parser = env::parse_port)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut daemon_env = env::from_env().map_err(|message| anyhow::anyhow!(message))?;
    if let Some(transport) = cli.transport {
        daemon_env.transport = transport;
    }
    if let Some(port) = cli.port {
        daemon_env.port = port;
    }

    if !cli.server {
        anyhow::bail!("nothing to do: pass --server to run the daemon");
    }

    let db_path = pool::resolve_db_path(
        daemon_env.db_mode,
        daemon_env.repo_path.as_deref(),
        daemon_env.db_path.as_deref(),
    )?;
    let db = pool::open_pool(&db_path)
        .await
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let launcher = Arc::new(ClaudeCodeLauncher::new());
    let daemon = Daemon::start(db, &db_path, daemon_env.port, launcher).await?;

    match daemon.role {
        Role::Daemon => tracing::info!(port = daemon.port, "running as daemon"),
        Role::Client => tracing::info!(port = daemon.port, "running as client"),
    }

    match daemon_env.transport {
        Transport::Stdio => {
            // Serve stdin in the foreground; the HTTP transport (daemon
            // role) keeps running in the background for child agents.
            stdio::run_stdio(daemon.tools(), daemon.context()).await?;
        }
        Transport::Http => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to install Ctrl+C handler")?;
        }
    }

    daemon.shutdown().await;
    Ok(())
}
