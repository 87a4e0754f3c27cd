use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reconsuite_rs::config::Config;
use reconsuite_rs::executor::Executor;
use reconsuite_rs::hub::BroadcastHub;
use reconsuite_rs::server::{self, AppState};
use reconsuite_rs::store::MemoryStore;

/// reconsuite-rs: run recon tools as cancellable scans and stream their output live.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "reconsuite-rs",
    version,
    about = "Run recon tools as cancellable scans and stream their output live.",
    long_about = None
)]
struct Cli {
    /// Path to the YAML config file. A missing file means defaults.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reconsuite_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let store = Arc::new(MemoryStore::new());
    let hub = BroadcastHub::new();
    let executor = Executor::new(store.clone(), Arc::new(hub.clone()), &config);
    let state = AppState::new(executor.clone(), store, hub, &config);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutdown requested");
    };
    let served = server::serve(&config, state, shutdown).await;

    // Kill any tool processes still running before exiting.
    executor.shutdown().await;
    served
}
