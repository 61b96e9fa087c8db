//! Domain types shared across the tripdata workspace

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry from the remote archive listing.
///
/// Produced by the listing client; immutable for the duration of a single
/// pipeline pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveDescriptor {
    /// Object key, unique within the listing (e.g. "202101-citibike-tripdata.zip")
    pub name: String,

    /// Last-modified timestamp reported by the listing
    pub last_modified: DateTime<Utc>,

    /// Archive size in bytes
    pub size_bytes: i64,
}

impl std::fmt::Display for ArchiveDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} bytes, modified {})",
            self.name, self.size_bytes, self.last_modified
        )
    }
}

/// A payload extracted from an archive but not yet loaded.
///
/// Keyed by `file_name`; deleted once promoted to a [`CommittedRecord`] or
/// purged as a duplicate of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub file_name: String,
    pub local_path: String,
    pub parent_archive_last_modified: DateTime<Utc>,
    pub size_bytes: i64,
    pub row_count: i64,
}

/// A payload whose rows have been durably loaded.
///
/// Keyed by `file_name`; permanent unless explicitly purged. `row_count`
/// reflects the number of rows actually persisted, not the number read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedRecord {
    pub file_name: String,
    pub local_path: String,
    pub parent_archive_last_modified: DateTime<Utc>,
    pub size_bytes: i64,
    pub row_count: i64,
}

impl std::fmt::Display for CommittedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} bytes, {} rows)",
            self.file_name, self.size_bytes, self.row_count
        )
    }
}

/// The (name, size, parent-timestamp) triple that identifies an imported
/// payload for dedup purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub file_name: String,
    pub size_bytes: i64,
    pub parent_archive_last_modified: DateTime<Utc>,
}

impl From<&CommittedRecord> for FileIdentity {
    fn from(record: &CommittedRecord) -> Self {
        Self {
            file_name: record.file_name.clone(),
            size_bytes: record.size_bytes,
            parent_archive_last_modified: record.parent_archive_last_modified,
        }
    }
}

impl From<&StagingRecord> for FileIdentity {
    fn from(record: &StagingRecord) -> Self {
        Self {
            file_name: record.file_name.clone(),
            size_bytes: record.size_bytes,
            parent_archive_last_modified: record.parent_archive_last_modified,
        }
    }
}

/// A dock station, upserted by its natural identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub station_id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

impl std::fmt::Display for Station {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (ID: {})", self.name, self.station_id)
    }
}

/// Bike type as reported by the current schema's `rideable_type` field.
///
/// The legacy schema has no bike-type analog, so legacy rows always map to
/// `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BikeType {
    Electric,
    Classic,
    #[default]
    Unknown,
}

impl BikeType {
    /// Map a raw `rideable_type` value to a bike type.
    pub fn from_rideable_type(raw: &str) -> Self {
        match raw {
            "electric_bike" => BikeType::Electric,
            "classic_bike" => BikeType::Classic,
            _ => BikeType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BikeType::Electric => "electric",
            BikeType::Classic => "classic",
            BikeType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for BikeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BikeType {
    type Err = crate::CommonError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "electric" => Ok(BikeType::Electric),
            "classic" => Ok(BikeType::Classic),
            "unknown" => Ok(BikeType::Unknown),
            other => Err(crate::CommonError::Parse(format!(
                "invalid bike type: {other}"
            ))),
        }
    }
}

/// A bike, upserted by its natural identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bike {
    pub bike_id: i64,
    pub bike_type: BikeType,
}

/// Rider gender as encoded by the legacy schema (0/1/2).
///
/// The current schema carries no gender field; rows map to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    #[default]
    Unknown,
    Male,
    Female,
}

impl Gender {
    /// Decode the legacy numeric encoding; anything unrecognized is `Unknown`.
    pub fn from_legacy_code(raw: &str) -> Self {
        match raw.trim() {
            "1" => Gender::Male,
            "2" => Gender::Female,
            _ => Gender::Unknown,
        }
    }

    pub fn as_code(&self) -> i16 {
        match self {
            Gender::Unknown => 0,
            Gender::Male => 1,
            Gender::Female => 2,
        }
    }

    pub fn from_code(code: i16) -> Self {
        match code {
            1 => Gender::Male,
            2 => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

/// A single ride.
///
/// Station and bike references are weak: the identifier is kept even if the
/// referent is later removed (null-on-delete). `source_file` is an owning
/// reference to a [`CommittedRecord`]; deleting that record removes the ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub ride_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub start_station: Option<i64>,
    pub end_station: Option<i64>,
    pub bike: Option<i64>,
    pub rider_birth_year: Option<i32>,
    pub rider_gender: Gender,
    pub rider_casual_or_member: Option<String>,
    pub source_file: String,
}
