//! aq-broker: standalone message broker for the asyncq runtime.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use asyncq_broker::{Broker, BrokerConfig};

#[derive(Parser, Debug)]
#[command(name = "aq-broker", about = "In-memory task queue broker", version)]
struct Args {
    /// Path to a YAML config file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    let broker = Broker::new(config)?;

    let handle = broker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            handle.shutdown();
        }
    });

    let metrics = broker.metrics();
    broker.run().await?;
    tracing::debug!("final metrics:\n{}", metrics.render());
    Ok(())
}
