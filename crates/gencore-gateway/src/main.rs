//! GenCore gateway — entry point.
//!
//! Configuration is resolved in layers: built-in defaults ← `--config`
//! file ← `GC_MODEL_PATH` environment override ← CLI flags. The process
//! exits non-zero when the configuration is invalid or the model fails to
//! load, and zero on a clean signal-driven shutdown.

use clap::Parser;
use gencore_gateway::GatewayConfig;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "gencore-gateway",
    about = "Local inference gateway with an OpenAI-compatible API",
    version
)]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overrides the config file.
    #[arg(long)]
    port: Option<u16>,

    /// Skip hardware probing and use default runtime parameters.
    #[arg(long)]
    skip_optimization: bool,

    /// Re-probe and benchmark even if the stored profile is fresh.
    #[arg(long)]
    force_optimization: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gencore_gateway=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match GatewayConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => GatewayConfig::default(),
    };
    config.apply_env_overrides();

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.skip_optimization {
        config.optimization.skip = true;
    }
    if cli.force_optimization {
        config.optimization.force = true;
    }

    if let Err(e) = gencore_gateway::serve(config).await {
        error!(error = %e, "gateway failed");
        std::process::exit(1);
    }
}
