//! Staging bookkeeping
//!
//! Tracks which payloads are staged (extracted but not yet loaded) and which
//! are committed, backed by the repository. Also owns the local staged
//! artifacts: purging duplicates and archiving loaded payloads into the
//! committed directory.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use crate::repository::Repository;
use tripdata_common::types::{CommittedRecord, FileIdentity, StagingRecord};

/// Bookkeeping facade over the repository and the staging directory.
pub struct StagingStore {
    repo: Arc<dyn Repository>,
    staging_dir: PathBuf,
    committed_dir: PathBuf,
}

impl StagingStore {
    pub fn new(
        repo: Arc<dyn Repository>,
        staging_dir: impl Into<PathBuf>,
        committed_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            repo,
            staging_dir: staging_dir.into(),
            committed_dir: committed_dir.into(),
        }
    }

    /// Whether a payload with this name is currently staged.
    pub async fn is_staged(&self, file_name: &str) -> Result<bool> {
        Ok(self.repo.get_staging_record(file_name).await?.is_some())
    }

    /// Whether a payload with this name has already been committed.
    pub async fn is_committed(&self, file_name: &str) -> Result<bool> {
        let identities = self.repo.list_committed_file_identities().await?;
        Ok(identities.iter().any(|id| id.file_name == file_name))
    }

    /// Record extracted payloads as staged. Idempotent: records whose file
    /// name already exists are silently ignored.
    pub async fn record_staged(&self, records: &[StagingRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let created = self
            .repo
            .bulk_create_staging_records(records)
            .await
            .map_err(|e| IngestError::StagingPersistence(e.to_string()))?;
        info!(
            staged = created,
            attempted = records.len(),
            "Recorded staged payloads"
        );
        Ok(created)
    }

    /// Staged files whose (name, size, parent-timestamp) identity already
    /// matches a committed record — redundant downloads of already-imported
    /// content.
    pub async fn find_staged_duplicates_of_committed(&self) -> Result<Vec<String>> {
        let committed: Vec<FileIdentity> = self.repo.list_committed_file_identities().await?;
        let staged = self.repo.list_staging_records().await?;

        let duplicates = staged
            .iter()
            .filter(|record| committed.contains(&FileIdentity::from(*record)))
            .map(|record| record.file_name.clone())
            .collect();
        Ok(duplicates)
    }

    /// Remove local staged artifacts and their records. A failure to remove
    /// one local file is logged and does not abort the batch; every name is
    /// still attempted and its record deleted.
    pub async fn purge_staged(&self, names: &[String]) -> Result<usize> {
        let mut purged = 0;
        for name in names {
            let path = self.staging_dir.join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(file = %name, "Removed staged artifact"),
                Err(source) => {
                    let err = IngestError::LocalCleanup {
                        path: path.to_string_lossy().into_owned(),
                        source,
                    };
                    warn!(error = %err, "Could not remove staged artifact");
                },
            }
            self.repo.delete_staging_record(name).await?;
            purged += 1;
        }
        if purged > 0 {
            info!(purged, "Purged staged duplicates");
        }
        Ok(purged)
    }

    /// Promote a staged file to committed with the row count actually
    /// persisted. Upsert semantics keyed by file name make re-running safe.
    pub async fn promote(&self, file_name: &str, actual_row_count: i64) -> Result<CommittedRecord> {
        let committed_path = self
            .committed_dir
            .join(file_name)
            .to_string_lossy()
            .into_owned();
        let record = self
            .repo
            .promote_staging_to_committed(file_name, actual_row_count, &committed_path)
            .await
            .map_err(|e| IngestError::Promotion {
                file: file_name.to_string(),
                reason: e.to_string(),
            })?;
        info!(file = %file_name, rows = actual_row_count, "Promoted staged file");
        Ok(record)
    }

    /// Move a loaded payload from the staging to the committed directory,
    /// where it is retained for audit/replay. Non-fatal on failure.
    pub fn archive_local_file(&self, file_name: &str) -> Result<()> {
        let from = self.staging_dir.join(file_name);
        let to = self.committed_dir.join(file_name);
        std::fs::create_dir_all(&self.committed_dir)?;
        std::fs::rename(&from, &to).map_err(|source| IngestError::LocalCleanup {
            path: from.to_string_lossy().into_owned(),
            source,
        })?;
        debug!(file = %file_name, "Archived payload to committed directory");
        Ok(())
    }
}
