//! webssh-server: browser terminal gateway.
//!
//! Accepts WebSocket connections, reads a target-host descriptor from the
//! first frame, and bridges the socket to an SSH shell with a pseudo-terminal.

mod config;
mod server;
mod session;
mod ssh;
mod transport;

use clap::Parser;
use config::{CliOverrides, ServerConfig};
use server::WebSshServer;
use std::path::PathBuf;
use tracing::{error, info};

/// webssh-server: browser terminal gateway
#[derive(Parser, Debug)]
#[command(name = "webssh-server", version, about = "Browser terminal gateway over SSH")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, env = "WEBSSH_CONFIG", default_value = "~/.webssh/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Output batching interval in milliseconds
    #[arg(long)]
    flush_interval_ms: Option<u64>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            bind: self.bind.clone(),
            port: self.port,
            log_level: self.log_level.clone(),
            max_sessions: self.max_sessions,
            flush_interval_ms: self.flush_interval_ms,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load server config (file + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let config_result = ServerConfig::load(Some(&config_path), &cli.overrides());

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let level = match &config_result {
        Ok(cfg) => cfg.log_level.clone(),
        Err(_) => cli.log_level.clone().unwrap_or_else(|| "info".into()),
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let server_config = match config_result {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %server_config.listen_addr,
        "starting webssh-server"
    );

    let server = WebSshServer::new(server_config);
    if let Err(e) = server.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("webssh-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("received shutdown signal");
}
