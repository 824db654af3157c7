//! Burrow - public HTTP endpoints for services behind NAT
//!
//! Clients request a tunnel, receive a dedicated TCP port, and dial raw
//! tunnel sockets to it. Public requests for `<id>.<domain>` are forwarded
//! through those sockets back to the client.

use anyhow::{Context, Result};
use burrow_control::{ClientManager, ManagerConfig};
use burrow_server::{PublicServer, ServerConfig};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Burrow - expose local HTTP services on public subdomains
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Expose local HTTP services on public subdomains")]
#[command(version)]
struct Cli {
    /// Address the public HTTP listener binds to
    #[arg(long, env = "BURROW_ADDRESS", default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port the public HTTP listener binds to
    #[arg(long, env = "BURROW_PORT", default_value_t = 8080)]
    port: u16,

    /// Base domain tunnels are served under (e.g. lt.example.com)
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: String,

    /// Advertise https:// tunnel URLs (TLS is terminated by a front proxy)
    #[arg(long, env = "BURROW_SECURE")]
    secure: bool,

    /// Maximum simultaneous tunnel sockets per client
    #[arg(long, env = "BURROW_MAX_TCP_SOCKETS", default_value_t = 10)]
    max_tcp_sockets: usize,

    /// Idle timeout for tunnel sockets, in milliseconds
    #[arg(long, env = "BURROW_SOCKET_TIMEOUT_MS", default_value_t = 60_000)]
    socket_timeout_ms: u64,

    /// Redirect requests for the bare domain to this URL
    #[arg(long, env = "BURROW_LANDING")]
    landing: Option<String>,

    /// Cap on simultaneous tunnels (unlimited if not set)
    #[arg(long, env = "BURROW_MAX_CLIENTS")]
    max_clients: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let manager = ClientManager::new(ManagerConfig {
        max_sockets: cli.max_tcp_sockets,
        socket_timeout: Duration::from_millis(cli.socket_timeout_ms),
        max_clients: cli.max_clients,
        ..ManagerConfig::default()
    });

    let server = PublicServer::new(
        manager,
        ServerConfig {
            domain: cli.domain.clone(),
            secure: cli.secure,
            landing: cli.landing.clone(),
        },
    );

    let addr = SocketAddr::new(cli.address, cli.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind public listener on {addr}"))?;

    info!("serving tunnels for *.{} on {}", cli.domain, addr);

    tokio::select! {
        result = server.run(listener) => result.context("public server failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    Ok(())
}
