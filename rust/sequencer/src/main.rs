//! meshbench Test Sequencer service.
//!
//! This binary runs the control plane that node managers register with and
//! that clients submit test sequences to.
//!
//! # Usage
//!
//! ```bash
//! # Start with default settings
//! meshbench-sequencer
//!
//! # Start with custom port
//! meshbench-sequencer --port 10500
//!
//! # Start with a configuration file
//! meshbench-sequencer --config sequencer.toml
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use meshbench_core::{GrpcNodeConnector, SequencerConfig};
use meshbench_sequencer::{SequencerServer, SequencerState};

/// meshbench test sequencer
#[derive(Parser, Debug)]
#[command(name = "meshbench-sequencer")]
#[command(about = "Control-plane sequencer for meshbench workloads")]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = match &args.config {
        Some(path) => SequencerConfig::from_toml_file(path)?,
        None => SequencerConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(port) = args.port {
        config.port = port;
    }
    config.validate()?;

    tracing::info!("Starting meshbench test sequencer");
    tracing::info!("  Port: {}", config.port);
    tracing::info!("  Node connect timeout: {}ms", config.connect_timeout_ms);
    tracing::info!("  Node request timeout: {}ms", config.request_timeout_ms);

    let request_timeout = match config.request_timeout_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };
    let connector = Arc::new(GrpcNodeConnector::new(
        Duration::from_millis(config.connect_timeout_ms),
        request_timeout,
    ));
    let state = Arc::new(SequencerState::new(connector));

    let server = SequencerServer::bind(&config, state).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down sequencer...");
    server.shutdown();
    server.join().await?;

    Ok(())
}
