//! Trip-data ingest - archive ingestion tool

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tripdata_common::logging::{init_logging, LogConfig, LogLevel};
use tripdata_ingest::pipeline::{LoadCoordinator, PassState};
use tripdata_ingest::repository::{MemoryRepository, Repository};
use tripdata_ingest::IngestConfig;

#[derive(Parser, Debug)]
#[command(name = "tripdata-ingest")]
#[command(author, version, about = "Trip archive ingestion tool")]
struct Cli {
    /// Archive listing endpoint
    #[arg(long, env = "TRIPDATA_LISTING_URL", default_value = tripdata_ingest::config::DEFAULT_LISTING_URL)]
    listing_url: String,

    /// Directory for extracted-but-not-yet-loaded payloads
    #[arg(long, env = "TRIPDATA_STAGING_DIR", default_value = "./data/staging")]
    staging_dir: PathBuf,

    /// Directory for fully-loaded payloads, retained for audit
    #[arg(long, env = "TRIPDATA_COMMITTED_DIR", default_value = "./data/committed")]
    committed_dir: PathBuf,

    /// Worker-pool bound for extraction and loading
    #[arg(long, default_value_t = tripdata_ingest::config::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Retries for transient download failures
    #[arg(long, default_value_t = tripdata_ingest::config::DEFAULT_DOWNLOAD_RETRIES)]
    download_retries: u32,

    /// Cap on the number of archives staged per pass
    #[arg(long)]
    max_files_per_pass: Option<usize>,

    /// Postgres connection string; without it rows stay in memory (dry run)
    #[cfg(feature = "database")]
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbose flag
    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("tripdata-ingest".to_string())
        .build();

    // Merge with environment variables (they take precedence)
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    init_logging(&log_config)?;

    let repo = select_repository(&cli).await?;

    let mut config = IngestConfig::new(cli.listing_url, cli.staging_dir, cli.committed_dir);
    config.concurrency = cli.concurrency;
    config.download_retries = cli.download_retries;
    config.max_files_per_pass = cli.max_files_per_pass;

    let coordinator = LoadCoordinator::new(config, repo);

    let cancel = coordinator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, finishing current file");
            cancel.cancel();
        }
    });

    let summary = coordinator.run_pass().await?;
    info!(%summary, "Ingestion pass finished");

    match summary.state {
        PassState::Done => Ok(()),
        _ => anyhow::bail!(
            "pass failed: {}",
            summary.failure_reason.unwrap_or_else(|| "unknown".to_string())
        ),
    }
}

#[cfg(feature = "database")]
async fn select_repository(cli: &Cli) -> Result<Arc<dyn Repository>> {
    use tripdata_ingest::repository::PgRepository;

    match cli.database_url.as_deref() {
        Some(url) => Ok(Arc::new(PgRepository::connect(url).await?)),
        None => {
            warn!("No database URL configured, running against in-memory store");
            Ok(Arc::new(MemoryRepository::new()))
        },
    }
}

#[cfg(not(feature = "database"))]
async fn select_repository(_cli: &Cli) -> Result<Arc<dyn Repository>> {
    warn!("Built without database support, running against in-memory store");
    Ok(Arc::new(MemoryRepository::new()))
}
