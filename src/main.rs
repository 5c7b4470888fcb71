//! Toolhub server - main entry point.
//!
//! Opens the catalog store, loads definitions and serves two listeners:
//! - public: catalog, selector, execution, stats and metrics routes
//! - internal: secrets broker routes, keyed by `X-Internal-Key`

use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use toolhub_core::runtime::{self, Collaborators};
use toolhub_core::Config;

#[derive(Debug, Parser)]
#[command(name = "toolhub-server", version, about = "Tool catalog and execution runtime")]
struct Args {
    /// YAML configuration file. Without it defaults plus TOOLHUB_* env apply.
    #[arg(short, long, env = "TOOLHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Override the public listen address.
    #[arg(long)]
    public_addr: Option<String>,

    /// Override the internal listen address.
    #[arg(long)]
    internal_addr: Option<String>,

    /// Override the definitions directory.
    #[arg(long)]
    definitions: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env()?,
    };
    if let Some(addr) = args.public_addr {
        config.server.public_addr = addr;
    }
    if let Some(addr) = args.internal_addr {
        config.server.internal_addr = addr;
    }
    if let Some(dir) = args.definitions {
        config.catalog.definitions_dir = dir;
    }

    toolhub_core::observability::init_tracing(&config.observability);
    tracing::info!(secrets = ?config.secrets, "starting toolhub-server");

    let state = runtime::build(&config, Collaborators::default()).await?;
    runtime::bootstrap(&state).await?;

    let shutdown = CancellationToken::new();
    let reaper = state.store.pool().spawn_reaper(shutdown.child_token());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
        }
        signal.cancel();
    });

    toolhub_core::server::serve(state, &config.server, shutdown.clone()).await?;
    shutdown.cancel();
    let _ = reaper.await;
    Ok(())
}
