//! End-to-end pipeline tests
//!
//! Run the full pass against a mock archive bucket and an in-memory
//! repository, including the partial-failure paths: a failed bulk load or
//! promotion must leave the file staged and a later pass must finish the job
//! without duplicating rides.

use async_trait::async_trait;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tripdata_common::types::{
    Bike, CommittedRecord, FileIdentity, Ride, StagingRecord, Station,
};
use tripdata_ingest::pipeline::{LoadCoordinator, PassState};
use tripdata_ingest::repository::{
    MemoryRepository, Repository, RepositoryError, RepositoryResult,
};
use tripdata_ingest::IngestConfig;

const CURRENT_CSV: &str = "\
ride_id,rideable_type,started_at,ended_at,start_station_name,start_station_id,end_station_name,end_station_id,start_lat,start_lng,end_lat,end_lng,member_casual
R1,electric_bike,2021-01-05 10:00:00,2021-01-05 10:20:00,Broadway & W 25 St,6173,W 27 St & 7 Ave,6427,40.7441,-73.9888,40.7454,-73.9932,member
R2,classic_bike,2021-01-05 11:00:00,2021-01-05 11:30:00,Broadway & W 25 St,6173,Central Park S,3160,40.7441,-73.9888,40.7659,-73.9763,casual
";

const LEGACY_CSV: &str = "\
tripduration,starttime,stoptime,start station id,start station name,start station latitude,start station longitude,end station id,end station name,end station latitude,end station longitude,bikeid,usertype,birth year,gender
680,2019-01-01 00:01:47.4010,2019-01-01 00:13:07.5810,3160,Central Park West & W 76 St,40.77896784,-73.97374737,2283,W 89 St & Columbus Ave,40.78807,-73.97016,15839,Subscriber,1971,1
521,2019-01-01 00:04:43.3360,2019-01-01 00:13:24.8860,3171,Amsterdam Ave & W 82 St,40.78520000,-73.97670000,3154,E 77 St & 3 Ave,40.77314000,-73.95856000,16340,Subscriber,\\N,0
";

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

fn listing_xml(entries: &[(&str, &str, i64)]) -> String {
    let mut body = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">\n\
         <Name>tripdata</Name>\n",
    );
    for (key, last_modified, size) in entries {
        body.push_str(&format!(
            "<Contents><Key>{key}</Key><LastModified>{last_modified}</LastModified>\
             <Size>{size}</Size></Contents>\n"
        ));
    }
    body.push_str("</ListBucketResult>");
    body
}

async fn mock_bucket(archives: &[(&str, &str, Vec<u8>)]) -> MockServer {
    let server = MockServer::start().await;

    let listing: Vec<(&str, &str, i64)> = archives
        .iter()
        .map(|(name, modified, bytes)| (*name, *modified, bytes.len() as i64))
        .collect();
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_xml(&listing)))
        .mount(&server)
        .await;

    for (name, _, bytes) in archives {
        Mock::given(method("GET"))
            .and(path(format!("/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.clone()))
            .mount(&server)
            .await;
    }

    server
}

fn test_config(server: &MockServer, root: &Path) -> IngestConfig {
    let mut config = IngestConfig::new(
        format!("{}/", server.uri()),
        root.join("staging"),
        root.join("committed"),
    );
    config.concurrency = 2;
    config.download_retries = 0;
    config
}

/// Repository wrapper that fails a configurable number of operations before
/// delegating, to simulate a store that dies mid-load.
struct FlakyRepository {
    inner: MemoryRepository,
    bulk_insert_failures: AtomicUsize,
    promote_failures: AtomicUsize,
}

impl FlakyRepository {
    fn failing_bulk_inserts(count: usize) -> Self {
        Self {
            inner: MemoryRepository::new(),
            bulk_insert_failures: AtomicUsize::new(count),
            promote_failures: AtomicUsize::new(0),
        }
    }

    fn failing_promotions(count: usize) -> Self {
        Self {
            inner: MemoryRepository::new(),
            bulk_insert_failures: AtomicUsize::new(0),
            promote_failures: AtomicUsize::new(count),
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Repository for FlakyRepository {
    async fn upsert_station(&self, station: &Station) -> RepositoryResult<()> {
        self.inner.upsert_station(station).await
    }

    async fn upsert_bike(&self, bike: &Bike) -> RepositoryResult<()> {
        self.inner.upsert_bike(bike).await
    }

    async fn bulk_insert_rides(&self, rides: &[Ride]) -> RepositoryResult<usize> {
        if Self::take_failure(&self.bulk_insert_failures) {
            return Err(RepositoryError::Backend("simulated outage".to_string()));
        }
        self.inner.bulk_insert_rides(rides).await
    }

    async fn get_staging_record(
        &self,
        file_name: &str,
    ) -> RepositoryResult<Option<StagingRecord>> {
        self.inner.get_staging_record(file_name).await
    }

    async fn list_staging_records(&self) -> RepositoryResult<Vec<StagingRecord>> {
        self.inner.list_staging_records().await
    }

    async fn bulk_create_staging_records(
        &self,
        records: &[StagingRecord],
    ) -> RepositoryResult<usize> {
        self.inner.bulk_create_staging_records(records).await
    }

    async fn promote_staging_to_committed(
        &self,
        file_name: &str,
        row_count: i64,
        committed_path: &str,
    ) -> RepositoryResult<CommittedRecord> {
        if Self::take_failure(&self.promote_failures) {
            return Err(RepositoryError::Backend("simulated outage".to_string()));
        }
        self.inner
            .promote_staging_to_committed(file_name, row_count, committed_path)
            .await
    }

    async fn delete_staging_record(&self, file_name: &str) -> RepositoryResult<bool> {
        self.inner.delete_staging_record(file_name).await
    }

    async fn list_committed_file_identities(&self) -> RepositoryResult<Vec<FileIdentity>> {
        self.inner.list_committed_file_identities().await
    }
}

fn staged_path(root: &Path, name: &str) -> PathBuf {
    root.join("staging").join(name)
}

fn committed_path(root: &Path, name: &str) -> PathBuf {
    root.join("committed").join(name)
}

#[tokio::test]
async fn test_full_pass_loads_archive() {
    let archive = zip_bytes(&[("202101-tripdata.csv", CURRENT_CSV)]);
    let server = mock_bucket(&[("202101-tripdata.zip", "2021-02-04T06:01:02.000Z", archive)]).await;
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MemoryRepository::new());

    let coordinator = LoadCoordinator::new(test_config(&server, dir.path()), repo.clone());
    let summary = coordinator.run_pass().await.unwrap();

    assert_eq!(summary.state, PassState::Done);
    assert_eq!(summary.archives_listed, 1);
    assert_eq!(summary.archives_staged, 1);
    assert_eq!(summary.files_loaded, 1);
    assert_eq!(summary.rows_loaded, 2);
    assert_eq!(summary.rows_skipped, 0);

    assert_eq!(repo.ride_count().await, 2);
    let committed = repo.committed_record("202101-tripdata.csv").await.unwrap();
    assert_eq!(committed.row_count, 2);

    // Referent upserted from row data
    let station = repo.station(6173).await.unwrap();
    assert_eq!(station.name, "Broadway & W 25 St");

    // Local payload moved from staging into the committed directory
    assert!(!staged_path(dir.path(), "202101-tripdata.csv").exists());
    assert!(committed_path(dir.path(), "202101-tripdata.csv").exists());
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let archive = zip_bytes(&[("202101-tripdata.csv", CURRENT_CSV)]);
    let server = mock_bucket(&[("202101-tripdata.zip", "2021-02-04T06:01:02.000Z", archive)]).await;
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MemoryRepository::new());

    let coordinator = LoadCoordinator::new(test_config(&server, dir.path()), repo.clone());
    coordinator.run_pass().await.unwrap();
    let second = coordinator.run_pass().await.unwrap();

    assert_eq!(second.state, PassState::Done);
    assert_eq!(second.archives_staged, 0);
    assert_eq!(second.files_loaded, 0);
    assert_eq!(repo.ride_count().await, 2);
}

#[tokio::test]
async fn test_legacy_rows_get_synthesized_ride_ids() {
    let archive = zip_bytes(&[("201901-tripdata.csv", LEGACY_CSV)]);
    let server = mock_bucket(&[("201901-tripdata.zip", "2019-02-01T00:00:00.000Z", archive)]).await;
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MemoryRepository::new());

    let coordinator = LoadCoordinator::new(test_config(&server, dir.path()), repo.clone());
    let summary = coordinator.run_pass().await.unwrap();

    assert_eq!(summary.state, PassState::Done);
    assert_eq!(summary.rows_loaded, 2);

    let rides = repo.rides_for_file("201901-tripdata.csv").await;
    assert_eq!(rides.len(), 2);
    for ride in &rides {
        assert!(ride.ride_id.starts_with("201901-tripdata.csv#"));
    }
    // The sentinel birth year normalizes to 0
    assert!(rides.iter().any(|r| r.rider_birth_year == Some(0)));
    assert!(rides.iter().any(|r| r.rider_birth_year == Some(1971)));
}

#[tokio::test]
async fn test_restaged_duplicate_is_purged_not_reloaded() {
    // The payload name does not follow the archive naming convention, so the
    // pre-download filter misses it and the second pass stages it again. The
    // dedup phase must then recognize the committed identity and purge the
    // duplicate without reloading.
    let archive = zip_bytes(&[("ride-data.csv", CURRENT_CSV)]);
    let server = mock_bucket(&[("bundle.zip", "2021-02-04T06:01:02.000Z", archive)]).await;
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MemoryRepository::new());

    let coordinator = LoadCoordinator::new(test_config(&server, dir.path()), repo.clone());
    let first = coordinator.run_pass().await.unwrap();
    assert_eq!(first.files_loaded, 1);

    let second = coordinator.run_pass().await.unwrap();
    assert_eq!(second.state, PassState::Done);
    assert_eq!(second.archives_staged, 1);
    assert_eq!(second.duplicates_purged, 1);
    assert_eq!(second.files_loaded, 0);
    assert_eq!(repo.ride_count().await, 2);
}

#[tokio::test]
async fn test_bulk_load_failure_leaves_file_staged_for_retry() {
    let archive = zip_bytes(&[("202101-tripdata.csv", CURRENT_CSV)]);
    let server = mock_bucket(&[("202101-tripdata.zip", "2021-02-04T06:01:02.000Z", archive)]).await;
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(FlakyRepository::failing_bulk_inserts(1));

    let coordinator = LoadCoordinator::new(test_config(&server, dir.path()), repo.clone());
    let first = coordinator.run_pass().await.unwrap();

    assert_eq!(first.state, PassState::Done);
    assert_eq!(first.files_failed, 1);
    assert_eq!(first.files_loaded, 0);
    assert_eq!(repo.inner.ride_count().await, 0);
    assert!(repo.inner.committed_record("202101-tripdata.csv").await.is_none());
    assert!(staged_path(dir.path(), "202101-tripdata.csv").exists());

    // The next pass skips the download (still staged) and finishes the load
    let second = coordinator.run_pass().await.unwrap();
    assert_eq!(second.state, PassState::Done);
    assert_eq!(second.archives_staged, 0);
    assert_eq!(second.files_loaded, 1);
    assert_eq!(repo.inner.ride_count().await, 2);
    assert!(repo.inner.committed_record("202101-tripdata.csv").await.is_some());
}

#[tokio::test]
async fn test_promotion_failure_is_recovered_without_duplicates() {
    let archive = zip_bytes(&[("202101-tripdata.csv", CURRENT_CSV)]);
    let server = mock_bucket(&[("202101-tripdata.zip", "2021-02-04T06:01:02.000Z", archive)]).await;
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(FlakyRepository::failing_promotions(1));

    let coordinator = LoadCoordinator::new(test_config(&server, dir.path()), repo.clone());
    let first = coordinator.run_pass().await.unwrap();

    // Rides landed before promotion failed; the file stays staged
    assert_eq!(first.files_failed, 1);
    assert_eq!(repo.inner.ride_count().await, 2);
    assert!(repo.inner.committed_record("202101-tripdata.csv").await.is_none());

    // Retrying inserts nothing new (ride ids already exist) and promotes
    let second = coordinator.run_pass().await.unwrap();
    assert_eq!(second.state, PassState::Done);
    assert_eq!(second.files_loaded, 1);
    assert_eq!(repo.inner.ride_count().await, 2);
    let committed = repo
        .inner
        .committed_record("202101-tripdata.csv")
        .await
        .unwrap();
    assert_eq!(committed.row_count, 2);
}

#[tokio::test]
async fn test_listing_failure_fails_pass_cleanly() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();

    let coordinator = LoadCoordinator::new(
        test_config(&server, dir.path()),
        Arc::new(MemoryRepository::new()),
    );
    let summary = coordinator.run_pass().await.unwrap();

    assert_eq!(summary.state, PassState::Failed);
    assert!(summary.failure_reason.unwrap().contains("500"));
}

#[tokio::test]
async fn test_empty_listing_ends_pass() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(listing_xml(&[])))
        .mount(&server)
        .await;
    let dir = tempfile::tempdir().unwrap();

    let coordinator = LoadCoordinator::new(
        test_config(&server, dir.path()),
        Arc::new(MemoryRepository::new()),
    );
    let summary = coordinator.run_pass().await.unwrap();

    assert_eq!(summary.state, PassState::Failed);
    assert_eq!(summary.archives_listed, 0);
    assert_eq!(summary.failure_reason.as_deref(), Some("no archives found"));
}

#[tokio::test]
async fn test_unreadable_archive_is_skipped_and_counted() {
    let good = zip_bytes(&[("202101-tripdata.csv", CURRENT_CSV)]);
    let server = mock_bucket(&[
        ("202101-tripdata.zip", "2021-02-04T06:01:02.000Z", good),
        (
            "202102-tripdata.zip",
            "2021-03-04T06:01:02.000Z",
            b"not a zip archive".to_vec(),
        ),
    ])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(MemoryRepository::new());

    let coordinator = LoadCoordinator::new(test_config(&server, dir.path()), repo.clone());
    let summary = coordinator.run_pass().await.unwrap();

    // The corrupt archive is skipped; the good one still loads
    assert_eq!(summary.state, PassState::Done);
    assert_eq!(summary.extraction_failures, 1);
    assert_eq!(summary.archives_staged, 1);
    assert_eq!(summary.files_loaded, 1);
    assert_eq!(repo.ride_count().await, 2);
}
