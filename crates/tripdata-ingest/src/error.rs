//! Error taxonomy for the ingestion pipeline
//!
//! Failures at row or file granularity (`RowParse`, `Extraction`, `BulkLoad`,
//! `LocalCleanup`) are absorbed by the coordinator, logged, and counted in the
//! pass summary. Failures at phase granularity (`ListingUnavailable`,
//! `StagingPersistence`) end the current pass; every mutating step is
//! idempotent, so the next pass resumes safely.

use thiserror::Error;

use crate::repository::RepositoryError;

/// Result type alias for ingest operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error type for the ingestion pipeline
#[derive(Error, Debug)]
pub enum IngestError {
    /// The configuration is invalid; the pass never starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The remote listing could not be retrieved. Recoverable: the pass ends
    /// cleanly and the next invocation retries.
    #[error("listing unavailable: {0}")]
    ListingUnavailable(String),

    /// The listing document could not be parsed.
    #[error("listing parse error: {0}")]
    ListingParse(#[from] quick_xml::DeError),

    /// A single archive could not be downloaded or unpacked. The file is
    /// skipped this pass and retried next run since it was never staged.
    #[error("extraction failed for {file}: {reason}")]
    Extraction { file: String, reason: String },

    /// Staging bookkeeping could not be persisted. Accumulated successes are
    /// flushed before the pass fails.
    #[error("staging persistence failed: {0}")]
    StagingPersistence(String),

    /// A single row could not be normalized; it is skipped and counted.
    #[error("row parse failed: {0}")]
    RowParse(String),

    /// Bulk persistence of a file's rows failed. The file stays staged and is
    /// retried next pass.
    #[error("bulk load failed for {file}: {reason}")]
    BulkLoad { file: String, reason: String },

    /// Promotion of a staged file failed. Promotion is keyed by file name and
    /// re-run idempotently next pass.
    #[error("promotion failed for {file}: {reason}")]
    Promotion { file: String, reason: String },

    /// A local staged artifact could not be removed or moved. Logged,
    /// non-fatal.
    #[error("local cleanup failed for {path}: {source}")]
    LocalCleanup {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Another pass holds the run lock for the same staging directories.
    #[error("another ingest pass is already running (lock at {0})")]
    PassInProgress(String),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
