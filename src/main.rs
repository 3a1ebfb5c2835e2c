//! Whitebox controller entry point.

use std::path::PathBuf;

use clap::Parser;
use kube::Client;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use whitebox_controller::config::Config;
use whitebox_controller::manager::Manager;

/// Generic Kubernetes controller framework driven by external handlers
#[derive(Parser, Debug)]
#[command(name = "whitebox-controller", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider for rustls before anything opens a TLS
    // connection.
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install crypto provider"))?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config = Config::load_file(&cli.config)
        .map_err(|e| anyhow::anyhow!("could not load configuration file: {e}"))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("could not connect to the cluster: {e}"))?;

    let manager = Manager::new(&config, client)
        .map_err(|e| anyhow::anyhow!("could not create manager: {e}"))?;

    tracing::info!(config = %cli.config.display(), "starting whitebox controller");
    manager
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("runtime error: {e}"))?;

    tracing::info!("shutting down");
    Ok(())
}
