//! store-transport - demo echo node
//!
//! Runs the connection pool manager over TCP with an echo handler. Useful for
//! exercising pooling and shutdown against real sockets.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use store_transport::{config::ConfigManager, shutdown, ConnectionPoolManager, TcpLayer};

/// CLI arguments for store-transport
#[derive(Parser, Debug)]
#[command(name = "store-transport")]
#[command(about = "Connection pooling transport node for peer-to-peer stores")]
#[command(version)]
#[command(long_about = "
Connection pooling transport node for peer-to-peer stores.

Accepts inbound connections and echoes whatever they send. Outbound
connections are pooled per host and reaped once idle for too long.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  STORE_TRANSPORT_BIND_ADDR      - Bind address (e.g., 127.0.0.1:4040)
  STORE_TRANSPORT_DIAL_TIMEOUT   - Outbound dial timeout (e.g., 5s)
  STORE_TRANSPORT_MAX_IDLE       - Idle time before pooled connections are reaped (e.g., 100s)
  STORE_TRANSPORT_REAP_INTERVAL  - Period of the idle reaper (e.g., 30s)
  STORE_TRANSPORT_LOG_LEVEL      - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "store-transport.toml")]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., 127.0.0.1:4040)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Outbound dial timeout in seconds
    #[arg(long)]
    pub dial_timeout: Option<u64>,

    /// Seconds a pooled connection may sit idle before it is reaped
    #[arg(long)]
    pub max_idle: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long)]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate_config: bool,

    /// After starting, send a line to this host over a pooled connection
    #[arg(long, value_name = "HOST")]
    pub probe: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    init_tracing(&args)?;

    info!("Starting store-transport v{}", env!("CARGO_PKG_VERSION"));

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        info!("Config file not found, checking environment variables");
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.dial_timeout,
        args.max_idle,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Dial timeout: {:?}", config.pool.dial_timeout);
        info!("  Max idle: {:?}", config.pool.max_idle);
        info!("  Reap interval: {:?}", config.pool.reap_interval);
        return Ok(());
    }

    let layer = Arc::new(
        TcpLayer::bind(config.server.bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?,
    );
    let local_addr = layer.local_addr();

    let manager = Arc::new(ConnectionPoolManager::from_config(
        layer,
        echo,
        &config.pool,
    ));
    manager.listen();

    info!("store-transport listening on {}", local_addr);

    if let Some(host) = args.probe.as_deref() {
        if let Err(e) = probe(&manager, host).await {
            warn!("Probe of {} failed: {:#}", host, e);
        }
    }

    if let Err(e) = shutdown::wait_for_signal().await {
        error!("Error setting up signal handlers: {}", e);
    }

    info!("Initiating graceful shutdown...");
    match tokio::time::timeout(config.server.shutdown_timeout, manager.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Error during shutdown: {:#}", e),
        Err(_) => warn!(
            "Shutdown did not finish within {:?}",
            config.server.shutdown_timeout
        ),
    }

    let stats = manager.stats();
    info!(
        "Server shutdown complete ({} accepted, {} dialed, {} reaped)",
        stats.total_accepted, stats.total_dialed, stats.total_reaped
    );

    Ok(())
}

/// Echo every byte back until the peer closes.
async fn echo(conn: TcpStream) -> store_transport::Result<()> {
    let (mut reader, mut writer) = tokio::io::split(conn);
    let echoed = tokio::io::copy(&mut reader, &mut writer).await?;
    tracing::debug!("Echoed {} bytes", echoed);
    Ok(())
}

/// Check out a connection to `host`, round-trip one line, and pool it again.
async fn probe(manager: &ConnectionPoolManager<TcpLayer>, host: &str) -> Result<()> {
    let mut conn = manager.get_conn(host).await?;

    conn.write_all(b"ping\n").await?;
    let mut line = String::new();
    BufReader::new(&mut *conn).read_line(&mut line).await?;
    info!("Probe of {} answered {:?}", host, line.trim_end());

    manager.return_conn(conn).await;
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
