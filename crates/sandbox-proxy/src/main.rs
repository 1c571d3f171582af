use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sandbox_proto::hosts::Allowlist;
use sandbox_token::TokenService;

/// Egress proxy: forwards HTTP and tunnels HTTPS (CONNECT) from sandbox
/// containers, enforcing a per-session host allowlist derived from the
/// session's egress token.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "SANDBOX_PROXY_ADDR", default_value = "0.0.0.0:15004")]
    addr: SocketAddr,

    /// Symmetric signing key shared with the session manager. Falling back
    /// to a random per-process key (when unset) disables cross-process
    /// token validation, the same caveat spec.md §6 calls out for the
    /// manager's own signing-key default.
    #[arg(long, env = "SANDBOX_SIGNING_KEY")]
    signing_key: Option<String>,

    /// Additional hosts appended to the compiled-in default allowlist used
    /// when a request carries no (or a malformed) egress token.
    #[arg(long = "default-host", env = "SANDBOX_PROXY_DEFAULT_HOSTS", value_delimiter = ',')]
    default_hosts: Vec<String>,

    /// Emit structured logs as JSON instead of human-readable text.
    #[arg(long)]
    json: bool,

    /// Increase logging verbosity (stackable: -v, -vv).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let signing_key = cli.signing_key.clone().unwrap_or_else(|| {
        tracing::warn!("no signing key configured; generating an ephemeral one (tokens from other processes will not validate)");
        let random: [u8; 32] = rand::random();
        hex::encode(random)
    });

    let mut default_patterns = Allowlist::default_registries().patterns().to_vec();
    for host in &cli.default_hosts {
        default_patterns.push(sandbox_proto::hosts::HostPattern::new(host));
    }
    let default_allowlist = Allowlist::new(default_patterns);

    let token_service = TokenService::new(signing_key.into_bytes());
    let state = Arc::new(sandbox_proxy::ProxyState::new(token_service, default_allowlist));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(cli.addr, state))
}

async fn run(addr: SocketAddr, state: Arc<sandbox_proxy::ProxyState>) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    sandbox_proxy::server::serve(addr, state, shutdown_rx)
        .await
        .context("running proxy server")
}

fn init_logging(verbose: u8, json: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("sandbox_proxy={level}")));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init().ok();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init().ok();
    }
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

    tracing::info!("shutdown signal received");
}
