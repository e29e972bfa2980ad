//! Entry point for the hostshell MCP server.
//!
//! Parses CLI flags, loads config (CLI overrides merge on top), initializes
//! tracing (to stderr, so it doesn't interfere with MCP stdio transport), and
//! serves on stdin/stdout. Exits non-zero on transport failure.

use anyhow::Result;
use clap::Parser;
use hostshell::config::{self, Config};
use hostshell::server::HostshellServer;
use rmcp::{ServiceExt, transport::stdio};
use std::path::PathBuf;
use tracing_subscriber::{self, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "hostshell", version, about = "MCP server exposing the host to LLM agents")]
struct Cli {
    /// Config file path. Defaults to ~/.hostshell/config.json.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Allowed directory; repeatable. Replaces the configured allow-list.
    #[arg(long = "allow", value_name = "DIR")]
    allow: Vec<String>,

    /// Additional deny-list token; repeatable.
    #[arg(long = "deny", value_name = "COMMAND")]
    deny: Vec<String>,

    /// Log level filter (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .unwrap_or_else(config::default_config_path);
    let mut config = Config::load_or_default(&config_path)?;

    if !cli.allow.is_empty() {
        config.allowed_directories = cli.allow;
    }
    config.blocked_commands.extend(cli.deny);
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    // Tracing to stderr (stdout is used for MCP JSON-RPC).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "starting hostshell MCP server"
    );

    let server = HostshellServer::new(&config);
    let service = server.serve(stdio()).await.inspect_err(|e| {
        tracing::error!("serving error: {:?}", e);
    })?;

    service.waiting().await?;
    tracing::info!("hostshell server shut down");
    Ok(())
}
