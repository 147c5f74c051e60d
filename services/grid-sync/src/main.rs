//! Reanalysis cache synchronizer.
//!
//! Brings the local Zarr store up to date with the remote dataset for every
//! hour in `[start, stop]`, then prints the sync report. Hours already cached
//! are not fetched again, so the command can be rerun safely.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use grid_cache::{parse_timestamp, CacheConfig, SyncEngine, SyncReport, ZarrRemoteSource};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "grid-sync")]
#[command(about = "Synchronize the local reanalysis cache over a time range")]
struct Args {
    /// First instant of the range (RFC 3339 or "YYYY-MM-DD HH:MM:SS", UTC)
    #[arg(long, value_parser = parse_instant)]
    start: DateTime<Utc>,

    /// Last instant of the range
    #[arg(long, value_parser = parse_instant)]
    stop: DateTime<Utc>,

    /// Local Zarr store directory
    #[arg(long, env = "GRID_CACHE_LOCAL_STORE")]
    local_store: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long, env = "GRID_CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Remote Zarr dataset URL
    #[arg(long)]
    remote_url: Option<String>,

    /// Fields to cache (comma separated)
    #[arg(long, value_delimiter = ',')]
    fields: Option<Vec<String>>,

    /// Pressure levels in hPa (comma separated)
    #[arg(long, value_delimiter = ',')]
    levels: Option<Vec<f64>>,

    /// Hours fetched concurrently
    #[arg(long)]
    concurrency: Option<usize>,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_instant(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_timestamp(&serde_json::Value::String(s.to_string())).map_err(|e| e.to_string())
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
    if let Some(fields) = &args.fields {
        config.fields = fields.iter().map(|f| f.trim().to_string()).collect();
    }
    if let Some(levels) = &args.levels {
        config.levels = levels.clone();
    }
    if let Some(n) = args.concurrency {
        config.fetch_concurrency = n;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install tracing subscriber: {}", e);
    }

    match run(args).await {
        Ok(report) if report.is_complete() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(e) => {
            error!(error = format!("{:#}", e), "Sync failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<SyncReport> {
    if args.stop < args.start {
        return Err(anyhow!("stop {} is before start {}", args.stop, args.start));
    }

    let config = load_config(&args)?;
    info!(
        local_store = %config.local_store.display(),
        remote_url = %config.remote_url,
        start = %args.start,
        stop = %args.stop,
        "Starting grid sync"
    );

    let remote = ZarrRemoteSource::connect(&config.remote_url)
        .await
        .with_context(|| format!("Failed to open remote dataset {}", config.remote_url))?;
    let engine = SyncEngine::new(config, Arc::new(remote));

    let report = tokio::select! {
        result = engine.sync(args.start, args.stop) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, hours appended so far are kept");
            return Err(anyhow!("interrupted"));
        }
    };

    info!(
        requested = report.requested.len(),
        fetched = report.fetched.len(),
        already_present = report.already_present.len(),
        unavailable = report.unavailable.len(),
        bootstrapped = report.bootstrapped,
        "Sync finished"
    );
    if !report.is_complete() {
        warn!(hours = ?report.unavailable, "Remote has no data for some hours");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_instant() {
        let expected = Utc.with_ymd_and_hms(2021, 10, 12, 1, 0, 0).unwrap();
        assert_eq!(parse_instant("2021-10-12T01:00:00Z").unwrap(), expected);
        assert_eq!(parse_instant("2021-10-12 01:00:00").unwrap(), expected);
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "grid-sync",
            "--start",
            "2021-10-12T00:00:00Z",
            "--stop",
            "2021-10-12T06:00:00Z",
            "--local-store",
            "/tmp/era5.zarr",
            "--fields",
            "temperature, specific_humidity",
            "--levels",
            "250,300",
            "--concurrency",
            "4",
        ]);
        let config = load_config(&args).expect("Config should be valid");

        assert_eq!(config.local_store, PathBuf::from("/tmp/era5.zarr"));
        assert_eq!(config.fields, vec!["temperature", "specific_humidity"]);
        assert_eq!(config.levels, vec![250.0, 300.0]);
        assert_eq!(config.fetch_concurrency, 4);
    }
}
