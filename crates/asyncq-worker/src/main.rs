use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use asyncq_protocol::message::RevokeRequest;
use asyncq_protocol::{Frame, FrameCodec};
use asyncq_worker::config::validate_concurrency;
use asyncq_worker::tasks::{AddTask, EchoTask, SleepTask};
use asyncq_worker::{TaskOptions, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "aq-worker")]
#[command(about = "Asyncq task worker", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the worker
    Worker(WorkerArgs),

    /// Mark a task revoked on every connected worker
    Revoke(RevokeArgs),
}

#[derive(clap::Args, Debug)]
struct WorkerArgs {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Broker address
    #[arg(short, long)]
    broker: Option<String>,

    /// Result store address (defaults to the broker address)
    #[arg(long)]
    result_backend: Option<String>,

    /// Disable result writes entirely
    #[arg(long)]
    no_result_backend: bool,

    /// Maximum simultaneous tasks
    #[arg(short, long)]
    concurrency: Option<i64>,

    /// Comma separated list of queues
    #[arg(short = 'Q', long)]
    queues: Option<String>,

    /// Per-queue prefetch window (defaults to concurrency)
    #[arg(long)]
    prefetch: Option<u16>,

    /// Worker node name (auto-generated if not provided)
    #[arg(long)]
    name: Option<String>,
}

#[derive(clap::Args, Debug)]
struct RevokeArgs {
    /// Broker address
    #[arg(short, long, default_value = "127.0.0.1:5672")]
    broker: String,

    /// Task id to revoke
    task_id: Uuid,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match args.command {
        Commands::Worker(worker_args) => run_worker(worker_args).await,
        Commands::Revoke(revoke_args) => run_revoke(revoke_args).await,
    }
}

async fn run_worker(args: WorkerArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => WorkerConfig::default(),
    };

    if let Some(broker) = args.broker {
        config.broker_addr = broker;
    }
    if let Some(requested) = args.concurrency {
        config.concurrency = exit_on_invalid_concurrency(requested);
    }
    // A config file can also carry a bad value; check before connecting.
    exit_on_invalid_concurrency(config.concurrency as i64);

    if let Some(queues) = args.queues {
        config.queues = queues
            .split(',')
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
    }
    if let Some(prefetch) = args.prefetch {
        config.prefetch = Some(prefetch);
    }
    if let Some(name) = args.name {
        config.worker_name = Some(name);
    }
    if args.no_result_backend {
        config.result_backend_addr = None;
    } else if let Some(addr) = args.result_backend {
        config.result_backend_addr = Some(addr);
    } else if config.result_backend_addr.is_none() {
        // The broker hosts the result store on the same wire.
        config.result_backend_addr = Some(config.broker_addr.clone());
    }

    let worker = Worker::new(config)?;
    worker.register("demo.echo", TaskOptions::default(), Arc::new(EchoTask));
    worker.register("demo.add", TaskOptions::default(), Arc::new(AddTask));
    worker.register("demo.sleep", TaskOptions::default(), Arc::new(SleepTask));

    let shutdown = worker.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("received shutdown signal");
        shutdown.cancel();
    });

    let metrics = worker.metrics();
    worker.run().await?;
    if let Ok(text) = metrics.render() {
        tracing::debug!("final metrics:\n{text}");
    }
    Ok(())
}

fn exit_on_invalid_concurrency(requested: i64) -> u16 {
    match validate_concurrency(requested) {
        Ok(value) => value,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    }
}

async fn run_revoke(args: RevokeArgs) -> anyhow::Result<()> {
    let stream = TcpStream::connect(&args.broker)
        .await
        .with_context(|| format!("connecting to broker at {}", args.broker))?;
    let mut transport = Framed::new(stream, FrameCodec);
    transport
        .send(Frame::Revoke(RevokeRequest {
            task_id: args.task_id,
        }))
        .await?;
    match transport.next().await {
        Some(Ok(Frame::Ok(_))) => {
            println!("revoked {}", args.task_id);
            Ok(())
        }
        Some(Ok(Frame::Error(reply))) => {
            anyhow::bail!("broker refused revoke: {}", reply.message)
        }
        Some(Ok(other)) => anyhow::bail!("unexpected reply: {:?}", other.frame_type()),
        Some(Err(error)) => Err(error.into()),
        None => anyhow::bail!("connection closed before the broker replied"),
    }
}
