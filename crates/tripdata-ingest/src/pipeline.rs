//! Pipeline orchestration
//!
//! One pass walks LISTING → STAGING → DEDUPING → LOADING → DONE, with FAILED
//! reachable from any phase. Errors are caught at the phase boundary, logged
//! with the phase identifier, and end the pass without crashing the process.
//! The next invocation re-derives its state from the repository and resumes,
//! because every mutating step is keyed by natural identifier and safe to
//! re-run.

use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::extract::ArchiveExtractor;
use crate::listing::ListingClient;
use crate::lock::RunLock;
use crate::normalize::RowNormalizer;
use crate::repository::Repository;
use crate::staging::StagingStore;
use tripdata_common::types::{ArchiveDescriptor, Bike, Ride, StagingRecord, Station};

/// Phase of a pipeline pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassState {
    #[default]
    Listing,
    Staging,
    Deduping,
    Loading,
    Done,
    Failed,
}

impl std::fmt::Display for PassState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PassState::Listing => "LISTING",
            PassState::Staging => "STAGING",
            PassState::Deduping => "DEDUPING",
            PassState::Loading => "LOADING",
            PassState::Done => "DONE",
            PassState::Failed => "FAILED",
        };
        write!(f, "{name}")
    }
}

/// Outcome counters for one pass. No skip is silent: every absorbed failure
/// increments a counter here.
#[derive(Debug, Default)]
pub struct PassSummary {
    pub state: PassState,
    pub failure_reason: Option<String>,
    pub archives_listed: usize,
    pub archives_staged: usize,
    pub extraction_failures: usize,
    pub duplicates_purged: usize,
    pub files_loaded: usize,
    pub files_failed: usize,
    pub rows_loaded: u64,
    pub rows_skipped: u64,
}

impl PassSummary {
    fn fail(&mut self, reason: impl Into<String>) {
        self.failure_reason = Some(reason.into());
        self.state = PassState::Failed;
    }
}

impl std::fmt::Display for PassSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} listed, {} staged ({} extraction failures), {} duplicates purged, \
             {} files loaded ({} failed), {} rows loaded, {} rows skipped",
            self.state,
            self.archives_listed,
            self.archives_staged,
            self.extraction_failures,
            self.duplicates_purged,
            self.files_loaded,
            self.files_failed,
            self.rows_loaded,
            self.rows_skipped,
        )?;
        if let Some(ref reason) = self.failure_reason {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

enum LoadOutcome {
    Loaded { rows: u64, skipped: u64 },
    Failed,
    Cancelled,
}

/// Orchestrates one full ingestion pass.
pub struct LoadCoordinator {
    config: IngestConfig,
    listing: ListingClient,
    extractor: ArchiveExtractor,
    staging: StagingStore,
    repo: Arc<dyn Repository>,
    cancel: CancellationToken,
}

impl LoadCoordinator {
    pub fn new(config: IngestConfig, repo: Arc<dyn Repository>) -> Self {
        let listing = ListingClient::new(config.listing_url.clone());
        let extractor = ArchiveExtractor::new(
            config.base_url(),
            config.staging_dir.clone(),
            config.download_retries,
        );
        let staging = StagingStore::new(
            repo.clone(),
            config.staging_dir.clone(),
            config.committed_dir.clone(),
        );
        Self {
            config,
            listing,
            extractor,
            staging,
            repo,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that lets a shutdown signal end the pass between files; the
    /// in-flight file's load always finishes first.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run one full pipeline pass.
    ///
    /// Returns `Err` only when the pass cannot start (invalid configuration
    /// or another pass holding the run lock). Everything after that is
    /// reported through the [`PassSummary`]; phase failures mark the pass
    /// FAILED without crashing the host.
    pub async fn run_pass(&self) -> Result<PassSummary> {
        self.config.validate()?;
        let _lock = RunLock::acquire(&self.config.staging_dir)?;
        std::fs::create_dir_all(&self.config.committed_dir)?;

        let mut summary = PassSummary::default();

        // LISTING
        summary.state = PassState::Listing;
        let archives = match self.listing.list_archives().await {
            Ok(archives) => archives,
            Err(err) => {
                error!(phase = %summary.state, error = %err, "Phase failed");
                summary.fail(err.to_string());
                return Ok(summary);
            },
        };
        summary.archives_listed = archives.len();
        if archives.is_empty() {
            warn!(phase = %summary.state, "No archives found, ending pass");
            summary.fail("no archives found");
            return Ok(summary);
        }
        info!(phase = %summary.state, count = archives.len(), "Found candidate archives");

        // STAGING
        summary.state = PassState::Staging;
        if let Err(err) = self.stage_archives(archives, &mut summary).await {
            error!(phase = %summary.state, error = %err, "Phase failed");
            summary.fail(err.to_string());
            return Ok(summary);
        }

        // DEDUPING
        summary.state = PassState::Deduping;
        match self.dedupe_staged().await {
            Ok(purged) => summary.duplicates_purged = purged,
            Err(err) => {
                error!(phase = %summary.state, error = %err, "Phase failed");
                summary.fail(err.to_string());
                return Ok(summary);
            },
        }

        // LOADING
        summary.state = PassState::Loading;
        if let Err(err) = self.load_staged(&mut summary).await {
            error!(phase = %summary.state, error = %err, "Phase failed");
            summary.fail(err.to_string());
            return Ok(summary);
        }

        if self.cancel.is_cancelled() {
            summary.fail("shutdown requested");
        } else {
            summary.state = PassState::Done;
        }
        info!(%summary, "Pass complete");
        Ok(summary)
    }

    /// STAGING: extract every candidate archive not already staged or
    /// committed, then flush whatever succeeded to the staging bookkeeping —
    /// even when some extractions failed, partial progress is preserved.
    async fn stage_archives(
        &self,
        archives: Vec<ArchiveDescriptor>,
        summary: &mut PassSummary,
    ) -> Result<()> {
        let mut candidates = Vec::new();
        for archive in archives {
            let payload = expected_payload_name(&archive.name);
            if self.staging.is_staged(&payload).await? {
                debug!(archive = %archive.name, "Already staged, skipping");
                continue;
            }
            if self.staging.is_committed(&payload).await? {
                debug!(archive = %archive.name, "Already committed, skipping");
                continue;
            }
            candidates.push(archive);
        }
        if let Some(cap) = self.config.max_files_per_pass {
            candidates.truncate(cap);
        }
        info!(count = candidates.len(), "Staging new archives");

        let outcomes: Vec<Option<Result<StagingRecord>>> = futures::stream::iter(
            candidates.into_iter().map(|archive| self.extract_one(archive)),
        )
        .buffer_unordered(self.config.concurrency)
        .collect()
        .await;

        let mut staged = Vec::new();
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Ok(record) => staged.push(record),
                Err(_) => summary.extraction_failures += 1,
            }
        }

        summary.archives_staged = self.staging.record_staged(&staged).await?;
        Ok(())
    }

    async fn extract_one(&self, archive: ArchiveDescriptor) -> Option<Result<StagingRecord>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        match self.extractor.extract(&archive).await {
            Ok(record) => Some(Ok(record)),
            Err(err) => {
                // Per-file failure: skipped this pass, retried next run
                // since it was never staged.
                warn!(archive = %archive.name, error = %err, "Extraction failed, skipping");
                Some(Err(err))
            },
        }
    }

    /// DEDUPING: purge staged files whose identity triple already matches a
    /// committed record.
    async fn dedupe_staged(&self) -> Result<usize> {
        let duplicates = self.staging.find_staged_duplicates_of_committed().await?;
        if duplicates.is_empty() {
            return Ok(0);
        }
        self.staging.purge_staged(&duplicates).await
    }

    /// LOADING: process staged payloads newest parent-modification first, so
    /// the freshest data lands first if the run is interrupted.
    async fn load_staged(&self, summary: &mut PassSummary) -> Result<()> {
        let mut staged = self.repo.list_staging_records().await?;
        order_newest_first(&mut staged);
        info!(count = staged.len(), "Loading staged payloads");

        let outcomes: Vec<LoadOutcome> =
            futures::stream::iter(staged.into_iter().map(|record| self.load_one(record)))
                .buffered(self.config.concurrency)
                .collect()
                .await;

        for outcome in outcomes {
            match outcome {
                LoadOutcome::Loaded { rows, skipped } => {
                    summary.files_loaded += 1;
                    summary.rows_loaded += rows;
                    summary.rows_skipped += skipped;
                },
                LoadOutcome::Failed => summary.files_failed += 1,
                LoadOutcome::Cancelled => {},
            }
        }
        Ok(())
    }

    async fn load_one(&self, record: StagingRecord) -> LoadOutcome {
        if self.cancel.is_cancelled() {
            debug!(file = %record.file_name, "Shutdown requested, leaving file staged");
            return LoadOutcome::Cancelled;
        }
        match self.try_load_one(&record).await {
            Ok((rows, skipped)) => LoadOutcome::Loaded { rows, skipped },
            Err(err) => {
                // The file stays staged and is retried next pass; committed
                // state is never lost or duplicated.
                error!(file = %record.file_name, error = %err, "Load failed, file stays staged");
                LoadOutcome::Failed
            },
        }
    }

    /// Load one staged payload: normalize rows, upsert referents,
    /// bulk-persist rides, promote, then archive the local file.
    async fn try_load_one(&self, record: &StagingRecord) -> Result<(u64, u64)> {
        let path = self.config.staging_dir.join(&record.file_name);
        let mut reader = csv::Reader::from_path(&path)?;
        let headers = reader.headers()?.clone();
        let normalizer = RowNormalizer::from_headers(&headers);
        debug!(
            file = %record.file_name,
            schema = %normalizer.schema(),
            "Normalizing payload"
        );

        let mut canonical = Vec::new();
        let mut skipped = 0u64;
        for (index, raw) in reader.records().enumerate() {
            let raw = match raw {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(file = %record.file_name, row = index, error = %err, "Skipping unreadable row");
                    skipped += 1;
                    continue;
                },
            };
            match normalizer.normalize(&raw) {
                Ok(row) => canonical.push((index, row)),
                Err(err) => {
                    warn!(file = %record.file_name, row = index, error = %err, "Skipping row");
                    skipped += 1;
                },
            }
        }

        for (_, row) in &canonical {
            if let Some(station_id) = row.start_station_id {
                self.repo
                    .upsert_station(&Station {
                        station_id,
                        name: row.start_station_name.clone(),
                        lat: row.start_station_lat.unwrap_or(0.0),
                        lon: row.start_station_lon.unwrap_or(0.0),
                    })
                    .await?;
            }
            if let Some(station_id) = row.end_station_id {
                self.repo
                    .upsert_station(&Station {
                        station_id,
                        name: row.end_station_name.clone(),
                        lat: row.end_station_lat.unwrap_or(0.0),
                        lon: row.end_station_lon.unwrap_or(0.0),
                    })
                    .await?;
            }
            if let Some(bike_id) = row.bike_id {
                self.repo
                    .upsert_bike(&Bike {
                        bike_id,
                        bike_type: row.bike_type,
                    })
                    .await?;
            }
        }

        let rides: Vec<Ride> = canonical
            .iter()
            .map(|(index, row)| Ride {
                ride_id: row
                    .ride_id
                    .clone()
                    .unwrap_or_else(|| synthesized_ride_id(&record.file_name, *index)),
                started_at: row.started_at,
                ended_at: row.ended_at,
                start_station: row.start_station_id,
                end_station: row.end_station_id,
                bike: row.bike_id,
                rider_birth_year: Some(row.rider_birth_year),
                rider_gender: row.rider_gender,
                rider_casual_or_member: row.rider_casual_or_member.clone(),
                source_file: record.file_name.clone(),
            })
            .collect();

        self.repo
            .bulk_insert_rides(&rides)
            .await
            .map_err(|e| IngestError::BulkLoad {
                file: record.file_name.clone(),
                reason: e.to_string(),
            })?;

        self.staging
            .promote(&record.file_name, rides.len() as i64)
            .await?;

        if let Err(err) = self.staging.archive_local_file(&record.file_name) {
            // Non-fatal: the rows are committed, only the audit copy failed.
            warn!(file = %record.file_name, error = %err, "Could not archive staged file");
        }

        Ok((rides.len() as u64, skipped))
    }
}

/// The payload a monthly archive carries, by naming convention: the archive
/// stem with the tabular extension.
fn expected_payload_name(archive_name: &str) -> String {
    let stem = archive_name
        .strip_suffix(".zip")
        .unwrap_or(archive_name);
    format!("{stem}.csv")
}

/// Deterministic ride identifier for legacy rows, which carry none of their
/// own. Stable across re-runs of the same file, so retries stay idempotent.
fn synthesized_ride_id(file_name: &str, row_index: usize) -> String {
    format!("{file_name}#{row_index}")
}

fn order_newest_first(records: &mut [StagingRecord]) {
    records.sort_by(|a, b| {
        b.parent_archive_last_modified
            .cmp(&a.parent_archive_last_modified)
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn staged(name: &str, day: u32) -> StagingRecord {
        StagingRecord {
            file_name: name.to_string(),
            local_path: format!("/staging/{name}"),
            parent_archive_last_modified: Utc.with_ymd_and_hms(2021, 1, day, 0, 0, 0).unwrap(),
            size_bytes: 100,
            row_count: 0,
        }
    }

    #[test]
    fn test_expected_payload_name() {
        assert_eq!(
            expected_payload_name("202101-citibike-tripdata.zip"),
            "202101-citibike-tripdata.csv"
        );
        assert_eq!(expected_payload_name("no-suffix"), "no-suffix.csv");
    }

    #[test]
    fn test_synthesized_ride_id_is_deterministic() {
        assert_eq!(
            synthesized_ride_id("a.csv", 7),
            synthesized_ride_id("a.csv", 7)
        );
        assert_ne!(
            synthesized_ride_id("a.csv", 7),
            synthesized_ride_id("b.csv", 7)
        );
    }

    #[test]
    fn test_order_newest_first() {
        let mut records = vec![staged("old.csv", 1), staged("new.csv", 20), staged("mid.csv", 10)];
        order_newest_first(&mut records);
        let names: Vec<&str> = records.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, vec!["new.csv", "mid.csv", "old.csv"]);
    }

    #[test]
    fn test_summary_display_reports_failure_reason() {
        let mut summary = PassSummary::default();
        summary.fail("no archives found");
        let rendered = summary.to_string();
        assert!(rendered.starts_with("FAILED"));
        assert!(rendered.contains("no archives found"));
    }
}
