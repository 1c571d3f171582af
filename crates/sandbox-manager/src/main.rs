use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sandbox_container::{ContainerRuntime, ContainerRuntimeApi};
use sandbox_manager::config::{Cli, ManagerConfig};
use sandbox_manager::rpc::SandboxRpc;
use sandbox_manager::service::SessionManager;
use sandbox_proto::rpc::sandbox_service_server::SandboxServiceServer;
use sandbox_token::TokenService;
use tonic::transport::Server;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    let config = ManagerConfig::load(&cli).context("loading manager configuration")?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(config))
}

async fn run(config: ManagerConfig) -> Result<()> {
    let rpc_addr = config.rpc_addr;

    let signing_key = config.signing_key.clone().unwrap_or_else(|| {
        tracing::warn!("no signing key configured; generating an ephemeral one (tokens will not validate against a separately-started proxy)");
        let random: [u8; 32] = rand::random();
        hex::encode(random)
    });

    let runtime = Arc::new(ContainerRuntime::new());
    tracing::info!(engine = %runtime.runtime_type(), "using container engine");

    match runtime.image_exists(&config.image).await {
        Ok(true) => tracing::info!(image = %config.image, "session image present"),
        Ok(false) => tracing::warn!(image = %config.image, "session image not found locally; sessions will fail to start until it is pulled"),
        Err(e) => tracing::warn!(image = %config.image, error = %e, "could not check session image presence"),
    }

    let tokens = TokenService::new(signing_key.into_bytes());
    let manager = Arc::new(SessionManager::new(config, runtime, tokens));
    manager.spawn_reaper();

    let rpc = SandboxRpc::new(Arc::clone(&manager));

    tracing::info!(%rpc_addr, "sandbox-manager listening");

    Server::builder()
        .add_service(SandboxServiceServer::new(rpc))
        .serve_with_shutdown(rpc_addr, shutdown_signal())
        .await
        .context("running manager gRPC server")?;

    manager.shutdown().await;
    tracing::info!("sandbox-manager shut down");
    Ok(())
}

fn init_logging(verbose: u8, json: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("sandbox_manager={level}")));

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
