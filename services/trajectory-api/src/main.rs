//! Trajectory API Server
//!
//! Interpolates cached reanalysis fields along submitted flight trajectories,
//! syncing the local store from the remote dataset on demand.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use grid_cache::{AltitudeUnit, CacheConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use trajectory_api::{create_router, AppState};

/// Trajectory API Server
#[derive(Parser, Debug)]
#[command(name = "trajectory-api")]
#[command(about = "Interpolates reanalysis fields along flight trajectories")]
struct Args {
    /// Local Zarr store directory
    #[arg(long, env = "GRID_CACHE_LOCAL_STORE")]
    local_store: Option<PathBuf>,

    /// Listen host
    #[arg(long, default_value = "0.0.0.0", env = "TRAJECTORY_API_HOST")]
    host: String,

    /// Listen port
    #[arg(short, long, default_value = "9800", env = "TRAJECTORY_API_PORT")]
    port: u16,

    /// YAML configuration file
    #[arg(short, long, env = "GRID_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Remote Zarr dataset URL
    #[arg(long)]
    remote_url: Option<String>,

    /// Unit of the trajectory altitude column (feet or meters)
    #[arg(long)]
    altitude_unit: Option<String>,

    /// Log level
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Number of worker threads
    #[arg(long, env = "TRAJECTORY_API_WORKER_THREADS")]
    worker_threads: Option<usize>,
}

fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();

    if let Some(threads) = args.worker_threads {
        runtime_builder.worker_threads(threads);
    }

    let runtime = runtime_builder
        .build()
        .context("Failed to create Tokio runtime")?;

    runtime.block_on(run_server(args))
}

/// Defaults, then the YAML file, then `GRID_CACHE_*` variables, then flags.
fn load_config(args: &Args) -> Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)?,
        None => CacheConfig::default(),
    };
    config.apply_env();

    if let Some(path) = &args.local_store {
        config.local_store = path.clone();
    }
    if let Some(url) = &args.remote_url {
        config.remote_url = url.clone();
    }
    if let Some(unit) = &args.altitude_unit {
        config.altitude_unit = AltitudeUnit::parse(unit)
            .with_context(|| format!("Unknown altitude unit: {}", unit))?;
    }

    config.validate()?;
    Ok(config)
}

async fn run_server(args: Args) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .json()
        .init();

    info!("Starting trajectory API server");

    let config = load_config(&args)?;
    info!(
        local_store = %config.local_store.display(),
        remote_url = %config.remote_url,
        fields = ?config.fields,
        levels = config.levels.len(),
        altitude_unit = ?config.altitude_unit,
        "Configuration loaded"
    );

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Failed to install Prometheus recorder, /metrics disabled");
            None
        }
    };

    let state = AppState::from_config(config, prometheus)
        .await
        .context("Failed to initialize application state")?;

    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", args.host, args.port))?;

    info!("Trajectory API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server failed")?;

    Ok(())
}
