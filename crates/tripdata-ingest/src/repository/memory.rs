//! In-memory repository
//!
//! Keeps the whole store in process memory behind a mutex. Used by the test
//! suites and by `--repository memory` dry runs, where nothing should outlive
//! the process.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{Repository, RepositoryError, RepositoryResult};
use tripdata_common::types::{
    Bike, CommittedRecord, FileIdentity, Ride, StagingRecord, Station,
};

#[derive(Default)]
struct State {
    staging: HashMap<String, StagingRecord>,
    committed: HashMap<String, CommittedRecord>,
    stations: HashMap<i64, Station>,
    bikes: HashMap<i64, Bike>,
    rides: HashMap<String, Ride>,
}

/// Repository keeping all records in process memory.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted rides (test inspection).
    pub async fn ride_count(&self) -> usize {
        self.state.lock().await.rides.len()
    }

    /// Rides belonging to one source file (test inspection).
    pub async fn rides_for_file(&self, file_name: &str) -> Vec<Ride> {
        self.state
            .lock()
            .await
            .rides
            .values()
            .filter(|r| r.source_file == file_name)
            .cloned()
            .collect()
    }

    /// Committed record by file name (test inspection).
    pub async fn committed_record(&self, file_name: &str) -> Option<CommittedRecord> {
        self.state.lock().await.committed.get(file_name).cloned()
    }

    /// Station by id (test inspection).
    pub async fn station(&self, station_id: i64) -> Option<Station> {
        self.state.lock().await.stations.get(&station_id).cloned()
    }

    /// Seed a committed record directly, bypassing the pipeline (tests).
    pub async fn seed_committed(&self, record: CommittedRecord) {
        self.state
            .lock()
            .await
            .committed
            .insert(record.file_name.clone(), record);
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn upsert_station(&self, station: &Station) -> RepositoryResult<()> {
        self.state
            .lock()
            .await
            .stations
            .insert(station.station_id, station.clone());
        Ok(())
    }

    async fn upsert_bike(&self, bike: &Bike) -> RepositoryResult<()> {
        self.state.lock().await.bikes.insert(bike.bike_id, bike.clone());
        Ok(())
    }

    async fn bulk_insert_rides(&self, rides: &[Ride]) -> RepositoryResult<usize> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for ride in rides {
            if !state.rides.contains_key(&ride.ride_id) {
                state.rides.insert(ride.ride_id.clone(), ride.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_staging_record(
        &self,
        file_name: &str,
    ) -> RepositoryResult<Option<StagingRecord>> {
        Ok(self.state.lock().await.staging.get(file_name).cloned())
    }

    async fn list_staging_records(&self) -> RepositoryResult<Vec<StagingRecord>> {
        Ok(self.state.lock().await.staging.values().cloned().collect())
    }

    async fn bulk_create_staging_records(
        &self,
        records: &[StagingRecord],
    ) -> RepositoryResult<usize> {
        let mut state = self.state.lock().await;
        let mut created = 0;
        for record in records {
            if !state.staging.contains_key(&record.file_name) {
                state.staging.insert(record.file_name.clone(), record.clone());
                created += 1;
            }
        }
        Ok(created)
    }

    async fn promote_staging_to_committed(
        &self,
        file_name: &str,
        row_count: i64,
        committed_path: &str,
    ) -> RepositoryResult<CommittedRecord> {
        let mut state = self.state.lock().await;

        let metadata = match state.staging.remove(file_name) {
            Some(staging) => (staging.parent_archive_last_modified, staging.size_bytes),
            None => match state.committed.get(file_name) {
                // Already promoted by an earlier run; re-running is a no-op.
                Some(existing) => return Ok(existing.clone()),
                None => {
                    return Err(RepositoryError::NotFound(format!(
                        "no staging record for {file_name}"
                    )))
                },
            },
        };

        let record = CommittedRecord {
            file_name: file_name.to_string(),
            local_path: committed_path.to_string(),
            parent_archive_last_modified: metadata.0,
            size_bytes: metadata.1,
            row_count,
        };
        state
            .committed
            .insert(file_name.to_string(), record.clone());
        Ok(record)
    }

    async fn delete_staging_record(&self, file_name: &str) -> RepositoryResult<bool> {
        Ok(self.state.lock().await.staging.remove(file_name).is_some())
    }

    async fn list_committed_file_identities(&self) -> RepositoryResult<Vec<FileIdentity>> {
        Ok(self
            .state
            .lock()
            .await
            .committed
            .values()
            .map(FileIdentity::from)
            .collect())
    }
}
