//! khala fleet broker daemon
//!
//! Runs the two MQTT listeners: the device side (formation handshake,
//! telemetry ingress) and the control side (subscribe-replay for support
//! UIs). Domain handlers are registered once at startup.
//!
//! ```bash
//! khalad --liberator-base-url https://registry.internal --liberator-token $TOKEN
//! khalad --devices-bind 0.0.0.0:1883 --control-bind 0.0.0.0:1884 --verbose
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use khala_broker::{Broker, ErrorSink, LogErrorSink, Server};
use khala_core::topic;
use khala_fleet::handlers;
use khala_fleet::{DeviceHandler, FormationMap, LiberatorClient};

#[derive(Parser)]
#[command(name = "khalad")]
#[command(about = "khala fleet broker - routes device telemetry to support clients")]
#[command(version)]
struct Cli {
    /// Device listener address
    #[arg(long, env = "KHALAD_DEVICES_BIND", default_value = "0.0.0.0:1883")]
    devices_bind: String,

    /// Control listener address
    #[arg(long, env = "KHALAD_CONTROL_BIND", default_value = "0.0.0.0:1884")]
    control_bind: String,

    /// Accept legacy topics with a leading slash (`/pylon/...`)
    #[arg(long, env = "KHALAD_SLASH_PREFIX_TOPICS")]
    slash_prefix_topics: bool,

    /// Per-read session deadline in seconds
    #[arg(long, env = "KHALAD_IDLE_TIMEOUT_SECS", default_value = "300")]
    idle_timeout_secs: u64,

    /// Prefix marking in-process-only topics
    #[arg(long, env = "KHALAD_INTERNAL_PREFIX", default_value = topic::DEFAULT_INTERNAL_PREFIX)]
    internal_prefix: String,

    /// Base URL of the device registry
    #[arg(long, env = "KHALAD_LIBERATOR_BASE_URL")]
    liberator_base_url: String,

    /// Bearer token for the device registry
    #[arg(long, env = "KHALAD_LIBERATOR_TOKEN", default_value = "")]
    liberator_token: String,

    /// Deployment environment tag carried on error reports
    #[arg(long, env = "KHALAD_ENVIRONMENT", default_value = "development")]
    environment: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    topic::set_internal_prefix(cli.internal_prefix);
    let idle_timeout = Duration::from_secs(cli.idle_timeout_secs);

    tracing::info!(
        environment = %cli.environment,
        devices = %cli.devices_bind,
        control = %cli.control_bind,
        "starting khalad"
    );

    let broker = Arc::new(Broker::new(cli.slash_prefix_topics));
    let formations = Arc::new(FormationMap::new());
    let error_sink: Arc<dyn ErrorSink> = Arc::new(LogErrorSink);

    handlers::register_all(&broker, &formations, &error_sink);

    let liberator = Arc::new(LiberatorClient::new(
        cli.liberator_base_url,
        cli.liberator_token,
    ));
    let device_handler = Arc::new(DeviceHandler::new(
        Arc::clone(&formations),
        Arc::clone(&broker),
        liberator,
    ));

    let devices_server = Server::bind(
        &cli.devices_bind,
        device_handler,
        idle_timeout,
        Arc::clone(&error_sink),
    )
    .await?;
    let control_server = Server::bind(
        &cli.control_bind,
        Arc::clone(&broker) as Arc<dyn khala_broker::SessionHandler>,
        idle_timeout,
        Arc::clone(&error_sink),
    )
    .await?;

    tokio::select! {
        result = devices_server.run() => result?,
        result = control_server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
