//! Postgres repository
//!
//! Every mutation is an upsert (`ON CONFLICT`) keyed by the natural
//! identifier, so any pipeline phase can be re-run after a crash without
//! duplicating state. Promotion runs its two statements in one transaction.
//!
//! Ride rows reference their source file and stations by identifier only;
//! referential integrity is resolved at the application level (weak
//! references with null-on-delete semantics), so ride inserts do not depend
//! on insertion order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use super::{Repository, RepositoryError, RepositoryResult};
use tripdata_common::types::{
    Bike, CommittedRecord, FileIdentity, Ride, StagingRecord, Station,
};

/// Repository backed by a Postgres database.
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    /// Connect to the database and run pending migrations.
    pub async fn connect(database_url: &str) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| RepositoryError::Backend(e.to_string()))?;

        info!("Connected to Postgres repository");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn staging_from_row(row: &sqlx::postgres::PgRow) -> StagingRecord {
    StagingRecord {
        file_name: row.get("file_name"),
        local_path: row.get("local_path"),
        parent_archive_last_modified: row.get("parent_archive_last_modified"),
        size_bytes: row.get("size_bytes"),
        row_count: row.get("row_count"),
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn upsert_station(&self, station: &Station) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stations (station_id, name, lat, lon)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (station_id)
            DO UPDATE SET name = EXCLUDED.name, lat = EXCLUDED.lat, lon = EXCLUDED.lon
            "#,
        )
        .bind(station.station_id)
        .bind(&station.name)
        .bind(station.lat)
        .bind(station.lon)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_bike(&self, bike: &Bike) -> RepositoryResult<()> {
        sqlx::query(
            r#"
            INSERT INTO bikes (bike_id, bike_type)
            VALUES ($1, $2)
            ON CONFLICT (bike_id)
            DO UPDATE SET bike_type = EXCLUDED.bike_type
            "#,
        )
        .bind(bike.bike_id)
        .bind(bike.bike_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bulk_insert_rides(&self, rides: &[Ride]) -> RepositoryResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;

        for ride in rides {
            let result = sqlx::query(
                r#"
                INSERT INTO rides (
                    ride_id, started_at, ended_at,
                    start_station, end_station, bike,
                    rider_birth_year, rider_gender, rider_casual_or_member,
                    source_file
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (ride_id) DO NOTHING
                "#,
            )
            .bind(&ride.ride_id)
            .bind(ride.started_at)
            .bind(ride.ended_at)
            .bind(ride.start_station)
            .bind(ride.end_station)
            .bind(ride.bike)
            .bind(ride.rider_birth_year)
            .bind(ride.rider_gender.as_code())
            .bind(&ride.rider_casual_or_member)
            .bind(&ride.source_file)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_staging_record(
        &self,
        file_name: &str,
    ) -> RepositoryResult<Option<StagingRecord>> {
        let row = sqlx::query(
            r#"
            SELECT file_name, local_path, parent_archive_last_modified, size_bytes, row_count
            FROM staging_files
            WHERE file_name = $1
            "#,
        )
        .bind(file_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(staging_from_row))
    }

    async fn list_staging_records(&self) -> RepositoryResult<Vec<StagingRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT file_name, local_path, parent_archive_last_modified, size_bytes, row_count
            FROM staging_files
            ORDER BY parent_archive_last_modified DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(staging_from_row).collect())
    }

    async fn bulk_create_staging_records(
        &self,
        records: &[StagingRecord],
    ) -> RepositoryResult<usize> {
        let mut tx = self.pool.begin().await?;
        let mut created = 0usize;

        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO staging_files (
                    file_name, local_path, parent_archive_last_modified, size_bytes, row_count
                )
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (file_name) DO NOTHING
                "#,
            )
            .bind(&record.file_name)
            .bind(&record.local_path)
            .bind(record.parent_archive_last_modified)
            .bind(record.size_bytes)
            .bind(record.row_count)
            .execute(&mut *tx)
            .await?;
            created += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn promote_staging_to_committed(
        &self,
        file_name: &str,
        row_count: i64,
        committed_path: &str,
    ) -> RepositoryResult<CommittedRecord> {
        let mut tx = self.pool.begin().await?;

        let staging = sqlx::query(
            r#"
            SELECT parent_archive_last_modified, size_bytes
            FROM staging_files
            WHERE file_name = $1
            FOR UPDATE
            "#,
        )
        .bind(file_name)
        .fetch_optional(&mut *tx)
        .await?;

        let (parent_modified, size_bytes): (DateTime<Utc>, i64) = match staging {
            Some(row) => (
                row.get("parent_archive_last_modified"),
                row.get("size_bytes"),
            ),
            None => {
                // Staging record already consumed by an earlier promotion;
                // return the existing committed record if one exists.
                let existing = sqlx::query(
                    r#"
                    SELECT file_name, local_path, parent_archive_last_modified,
                           size_bytes, row_count
                    FROM committed_files
                    WHERE file_name = $1
                    "#,
                )
                .bind(file_name)
                .fetch_optional(&mut *tx)
                .await?;

                tx.rollback().await?;
                return match existing {
                    Some(row) => Ok(CommittedRecord {
                        file_name: row.get("file_name"),
                        local_path: row.get("local_path"),
                        parent_archive_last_modified: row.get("parent_archive_last_modified"),
                        size_bytes: row.get("size_bytes"),
                        row_count: row.get("row_count"),
                    }),
                    None => Err(RepositoryError::NotFound(format!(
                        "no staging record for {file_name}"
                    ))),
                };
            },
        };

        sqlx::query(
            r#"
            INSERT INTO committed_files (
                file_name, local_path, parent_archive_last_modified, size_bytes, row_count
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (file_name)
            DO UPDATE SET local_path = EXCLUDED.local_path,
                          parent_archive_last_modified = EXCLUDED.parent_archive_last_modified,
                          size_bytes = EXCLUDED.size_bytes,
                          row_count = EXCLUDED.row_count
            "#,
        )
        .bind(file_name)
        .bind(committed_path)
        .bind(parent_modified)
        .bind(size_bytes)
        .bind(row_count)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM staging_files WHERE file_name = $1")
            .bind(file_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(CommittedRecord {
            file_name: file_name.to_string(),
            local_path: committed_path.to_string(),
            parent_archive_last_modified: parent_modified,
            size_bytes,
            row_count,
        })
    }

    async fn delete_staging_record(&self, file_name: &str) -> RepositoryResult<bool> {
        let result = sqlx::query("DELETE FROM staging_files WHERE file_name = $1")
            .bind(file_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_committed_file_identities(&self) -> RepositoryResult<Vec<FileIdentity>> {
        let rows = sqlx::query(
            r#"
            SELECT file_name, size_bytes, parent_archive_last_modified
            FROM committed_files
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| FileIdentity {
                file_name: row.get("file_name"),
                size_bytes: row.get("size_bytes"),
                parent_archive_last_modified: row.get("parent_archive_last_modified"),
            })
            .collect())
    }
}
