use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use strand_core::{Worker, WorkerConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod api;
mod config;

use config::{AppState, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "strand")]
#[command(about = "Workflow graph execution engine with leased polling workers", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "STRAND_CONFIG", default_value = "strand.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, env = "STRAND_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Override `[worker] concurrency` from the configuration file
    #[arg(short, long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strand=info,strand_core=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Strand");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let mut config = ServerConfig::load(&args.config, args.data_dir)?;
    if let Some(workers) = args.workers {
        config.worker.concurrency = workers;
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(&config, shutdown.clone())?;
    let workers = spawn_workers(&state, &config.worker, &shutdown);

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    let served = api::serve(&addr, state, shutdown.clone()).await;

    // Workers finish their current cycle before exiting
    shutdown.cancel();
    for result in futures::future::join_all(workers).await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    tracing::info!("Strand stopped");

    served
}

fn spawn_workers(
    state: &AppState,
    config: &WorkerConfig,
    shutdown: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let count = config.concurrency.max(1);
    tracing::info!(count, "Starting workers");

    (0..count)
        .map(|_| {
            let worker = Worker::new(state.engine.clone(), config.clone());
            tokio::spawn(worker.run(shutdown.clone()))
        })
        .collect()
}
