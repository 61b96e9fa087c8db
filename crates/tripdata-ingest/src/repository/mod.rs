//! Abstract persistence port
//!
//! The pipeline treats the relational store as a transactional contract keyed
//! by natural identifiers (file name, station id, bike id, ride id). Every
//! mutating operation is an upsert or insert-or-ignore, which is what makes
//! re-running any pipeline phase safe.
//!
//! Implementations: [`memory::MemoryRepository`] for tests and dry runs, and
//! [`postgres::PgRepository`] behind the `database` feature.

use async_trait::async_trait;
use thiserror::Error;

use tripdata_common::types::{
    Bike, CommittedRecord, FileIdentity, Ride, StagingRecord, Station,
};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::MemoryRepository;
#[cfg(feature = "database")]
pub use postgres::PgRepository;

/// Result type alias for repository operations
pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

/// Error type for repository operations
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        RepositoryError::Backend(err.to_string())
    }
}

/// Persistence operations the pipeline depends on.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert or update a station by its natural identifier.
    async fn upsert_station(&self, station: &Station) -> RepositoryResult<()>;

    /// Insert or update a bike by its natural identifier.
    async fn upsert_bike(&self, bike: &Bike) -> RepositoryResult<()>;

    /// Insert rides, ignoring any whose `ride_id` already exists. Returns the
    /// number of newly inserted rides.
    async fn bulk_insert_rides(&self, rides: &[Ride]) -> RepositoryResult<usize>;

    /// Look up a staging record by file name.
    async fn get_staging_record(&self, file_name: &str)
        -> RepositoryResult<Option<StagingRecord>>;

    /// All current staging records.
    async fn list_staging_records(&self) -> RepositoryResult<Vec<StagingRecord>>;

    /// Bulk insert staging records, silently ignoring duplicates by file
    /// name. Returns the number of newly created records.
    async fn bulk_create_staging_records(
        &self,
        records: &[StagingRecord],
    ) -> RepositoryResult<usize>;

    /// Promote a staged file: upsert the committed record from the staging
    /// record's metadata with the true persisted row count, then delete the
    /// staging record — as a single transaction keyed by file name, so a
    /// re-run after a crash cannot produce two conflicting current records.
    ///
    /// Idempotent: if the staging record is already gone but a committed
    /// record exists, the existing committed record is returned.
    async fn promote_staging_to_committed(
        &self,
        file_name: &str,
        row_count: i64,
        committed_path: &str,
    ) -> RepositoryResult<CommittedRecord>;

    /// Delete a staging record. Returns whether a record existed.
    async fn delete_staging_record(&self, file_name: &str) -> RepositoryResult<bool>;

    /// The (name, size, parent-timestamp) identities of every committed file,
    /// used for dedup filtering.
    async fn list_committed_file_identities(&self) -> RepositoryResult<Vec<FileIdentity>>;
}
