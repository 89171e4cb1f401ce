//! Keel Node - git server over smart HTTP and stdio.

use anyhow::Context;
use clap::{Parser, Subcommand};
use keel_git::Service;
use keel_node::config::NodeConfig;
use keel_node::observability::{init_logging, LogFormat};
use keel_node::repos::RepoRegistry;
use keel_node::{api, app_state_from_config, registry_from_config, stdio};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

/// Keel Node - Git-compatible version control server
#[derive(Parser, Debug)]
#[command(name = "keel-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (repositories are kept in memory without one)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve git over smart HTTP
    Serve {
        /// HTTP listen address
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Request body idle timeout in seconds
        #[arg(long)]
        idle_timeout: Option<u64>,
    },
    /// Run one session over stdin/stdout
    Stdio {
        /// git-upload-pack or git-receive-pack
        service: Service,
        /// Repository name
        repo: String,
    },
    /// Run the session named by SSH_ORIGINAL_COMMAND (for SSH forced commands)
    Ssh,
}

impl Args {
    fn config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref())?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Command::Serve {
            listen,
            idle_timeout,
        } = &self.command
        {
            if let Some(addr) = listen {
                config.listen_addr = *addr;
            }
            if let Some(secs) = idle_timeout {
                config.idle_timeout_secs = *secs;
            }
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.config()?;

    init_logging(&config.log_level, config.log_format);

    let registry = registry_from_config(&config);
    if let Some(dir) = &config.data_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
    }

    match args.command {
        Command::Serve { .. } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("starting tokio runtime")?;
            runtime.block_on(serve(config, Arc::new(registry)))
        }
        Command::Stdio { service, repo } => stdio::run(
            &registry,
            service,
            &repo,
            &config.serve_options(),
            config.push.auto_create,
            config.idle_timeout(),
        ),
        Command::Ssh => {
            let command = std::env::var("SSH_ORIGINAL_COMMAND")
                .context("SSH_ORIGINAL_COMMAND is not set")?;
            let (service, repo) = stdio::parse_ssh_command(&command)?;
            stdio::run(
                &registry,
                service,
                &repo,
                &config.serve_options(),
                config.push.auto_create,
                config.idle_timeout(),
            )
        }
    }
}

async fn serve(config: NodeConfig, registry: Arc<RepoRegistry>) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Keel node");
    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = ?config.data_dir,
        idle_timeout_secs = config.idle_timeout_secs,
        auto_create = config.push.auto_create,
        "Node configuration"
    );

    let app = api::create_router(app_state_from_config(&config, registry));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;

    tracing::info!(addr = %config.listen_addr, "Listening for git over HTTP");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    tracing::info!("Keel node stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
