//! Pipeline configuration
//!
//! Configuration is an explicit value passed to constructors, never
//! process-wide state. The binary builds it from CLI flags with environment
//! fallbacks.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{IngestError, Result};

/// Default public listing of trip archives.
pub const DEFAULT_LISTING_URL: &str = "https://s3.amazonaws.com/tripdata/";

/// Default worker-pool size for extraction and loading.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of download retries on transient failures.
pub const DEFAULT_DOWNLOAD_RETRIES: u32 = 3;

/// Ingest pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Listing endpoint URL (the archive index)
    pub listing_url: String,

    /// Directory holding extracted-but-not-yet-loaded payloads
    pub staging_dir: PathBuf,

    /// Directory holding fully-loaded payloads, retained for audit/replay
    pub committed_dir: PathBuf,

    /// Worker-pool bound for per-archive extraction and per-file loading
    pub concurrency: usize,

    /// Retries for transient download failures (exponential backoff)
    pub download_retries: u32,

    /// Optional per-pass cap on the number of archives staged.
    /// `None` processes the full filtered set.
    pub max_files_per_pass: Option<usize>,
}

impl IngestConfig {
    /// Create a configuration with default tuning for the given endpoints.
    pub fn new(
        listing_url: impl Into<String>,
        staging_dir: impl Into<PathBuf>,
        committed_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            listing_url: listing_url.into(),
            staging_dir: staging_dir.into(),
            committed_dir: committed_dir.into(),
            concurrency: DEFAULT_CONCURRENCY,
            download_retries: DEFAULT_DOWNLOAD_RETRIES,
            max_files_per_pass: None,
        }
    }

    /// Validate the configuration before a pass starts.
    pub fn validate(&self) -> Result<()> {
        if self.listing_url.trim().is_empty() {
            return Err(IngestError::Config(
                "listing URL must not be empty".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(IngestError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.staging_dir == self.committed_dir {
            return Err(IngestError::Config(
                "staging and committed directories must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Listing URL with a guaranteed trailing slash, for joining object keys.
    pub fn base_url(&self) -> String {
        if self.listing_url.ends_with('/') {
            self.listing_url.clone()
        } else {
            format!("{}/", self.listing_url)
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self::new(
            DEFAULT_LISTING_URL,
            PathBuf::from("./data/staging"),
            PathBuf::from("./data/committed"),
        )
    }
}
