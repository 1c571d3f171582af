use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

/// Sandbox process agent: runs as PID 1 inside a session container,
/// exposing exec and file I/O over HTTP on a fixed port.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "SANDBOX_AGENT_ADDR", default_value = "0.0.0.0:2024")]
    addr: SocketAddr,

    /// Virtual address space limit in bytes, enforced via RLIMIT_AS before
    /// the server starts serving. Unset means no self-imposed limit.
    #[arg(long, env = "SANDBOX_AGENT_MEMORY_LIMIT_BYTES")]
    memory_limit_bytes: Option<u64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    if let Some(bytes) = cli.memory_limit_bytes {
        sandbox_agent::rlimit::apply_memory_limit(bytes);
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(serve(cli.addr))
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandbox_agent=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}

async fn serve(addr: SocketAddr) -> Result<()> {
    sandbox_agent::reaper::spawn_reaper();

    let app = sandbox_agent::router();
    let listener = TcpListener::bind(addr).await.context("binding to address")?;

    tracing::info!(%addr, "sandbox-agent listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running agent server")?;

    tracing::info!("sandbox-agent shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining in-flight streams");
}
