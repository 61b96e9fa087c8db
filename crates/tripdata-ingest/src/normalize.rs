//! Multi-schema row normalization
//!
//! The published payloads changed shape over the years. The legacy schema is
//! recognized by its `tripduration` column; everything else is treated as the
//! current schema. Each variant carries an explicit field mapping resolved
//! once per file from the CSV header, with an explicit default policy per
//! field:
//!
//! - unparseable timestamps become `None` (logged, never a row abort)
//! - the legacy birth-year sentinel `\N` normalizes to 0
//! - a missing station name defaults to the literal `"unknown"`
//! - a missing/empty identifier is "no reference" (`None`); the literal `"0"`
//!   is the valid identifier 0 and must not collide with absent

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::StringRecord;
use tracing::warn;

use crate::error::{IngestError, Result};
use tripdata_common::types::{BikeType, Gender};

/// Legacy-only column whose presence flags the old schema.
const LEGACY_MARKER_COLUMN: &str = "tripduration";

/// Value the legacy schema uses for an unknown birth year.
const BIRTH_YEAR_SENTINEL: &str = "\\N";

/// Default station name when the payload carries none.
const UNKNOWN_STATION_NAME: &str = "unknown";

/// Timestamp formats observed across payload generations.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

/// Which historical payload schema a file uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    /// Pre-2021 shape: `tripduration`, `starttime`, `bikeid`, `birth year`, ...
    Legacy,
    /// Current shape: `ride_id`, `rideable_type`, `started_at`, ...
    Current,
}

impl SchemaKind {
    /// Detect the schema from a CSV header row.
    pub fn detect(headers: &StringRecord) -> Self {
        if headers.iter().any(|h| h.trim() == LEGACY_MARKER_COLUMN) {
            SchemaKind::Legacy
        } else {
            SchemaKind::Current
        }
    }
}

impl std::fmt::Display for SchemaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaKind::Legacy => write!(f, "legacy"),
            SchemaKind::Current => write!(f, "current"),
        }
    }
}

/// The normalized record shape, independent of source schema.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CanonicalRow {
    /// Natural ride identifier. The legacy schema carries none; the loader
    /// derives a deterministic identifier from the file name and row index.
    pub ride_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub start_station_id: Option<i64>,
    pub start_station_name: String,
    pub start_station_lat: Option<f64>,
    pub start_station_lon: Option<f64>,
    pub end_station_id: Option<i64>,
    pub end_station_name: String,
    pub end_station_lat: Option<f64>,
    pub end_station_lon: Option<f64>,
    pub bike_id: Option<i64>,
    pub bike_type: BikeType,
    pub rider_birth_year: i32,
    pub rider_gender: Gender,
    pub rider_casual_or_member: Option<String>,
}

/// Column positions for one schema variant, resolved once per file.
#[derive(Debug, Default)]
struct FieldIndices {
    ride_id: Option<usize>,
    started_at: Option<usize>,
    ended_at: Option<usize>,
    start_station_id: Option<usize>,
    start_station_name: Option<usize>,
    start_station_lat: Option<usize>,
    start_station_lon: Option<usize>,
    end_station_id: Option<usize>,
    end_station_name: Option<usize>,
    end_station_lat: Option<usize>,
    end_station_lon: Option<usize>,
    bike_id: Option<usize>,
    bike_type: Option<usize>,
    birth_year: Option<usize>,
    gender: Option<usize>,
    membership: Option<usize>,
}

impl FieldIndices {
    fn resolve(headers: &StringRecord, schema: SchemaKind) -> Self {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };

        match schema {
            SchemaKind::Legacy => Self {
                ride_id: None,
                started_at: find("starttime"),
                ended_at: find("stoptime"),
                start_station_id: find("start station id"),
                start_station_name: find("start station name"),
                start_station_lat: find("start station latitude"),
                start_station_lon: find("start station longitude"),
                end_station_id: find("end station id"),
                end_station_name: find("end station name"),
                end_station_lat: find("end station latitude"),
                end_station_lon: find("end station longitude"),
                bike_id: find("bikeid"),
                bike_type: None,
                birth_year: find("birth year"),
                gender: find("gender"),
                membership: find("usertype"),
            },
            SchemaKind::Current => Self {
                ride_id: find("ride_id"),
                started_at: find("started_at"),
                ended_at: find("ended_at"),
                start_station_id: find("start_station_id"),
                start_station_name: find("start_station_name"),
                start_station_lat: find("start_lat"),
                start_station_lon: find("start_lng"),
                end_station_id: find("end_station_id"),
                end_station_name: find("end_station_name"),
                end_station_lat: find("end_lat"),
                end_station_lon: find("end_lng"),
                bike_id: find("bike_id"),
                bike_type: find("rideable_type"),
                birth_year: None,
                gender: None,
                membership: find("member_casual"),
            },
        }
    }
}

/// Maps raw CSV records of one file into [`CanonicalRow`]s.
pub struct RowNormalizer {
    schema: SchemaKind,
    indices: FieldIndices,
}

impl RowNormalizer {
    /// Detect the schema from the header row and resolve its field mapping.
    pub fn from_headers(headers: &StringRecord) -> Self {
        let schema = SchemaKind::detect(headers);
        Self {
            schema,
            indices: FieldIndices::resolve(headers, schema),
        }
    }

    pub fn schema(&self) -> SchemaKind {
        self.schema
    }

    /// Normalize one raw record into the canonical shape.
    ///
    /// Returns [`IngestError::RowParse`] for values that cannot be
    /// interpreted (non-numeric identifiers or coordinates); the caller skips
    /// the row and counts it. Unparseable timestamps are tolerated as `None`.
    pub fn normalize(&self, record: &StringRecord) -> Result<CanonicalRow> {
        let field = |idx: Option<usize>| -> Option<&str> {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        let row = CanonicalRow {
            ride_id: field(self.indices.ride_id).map(str::to_string),
            started_at: field(self.indices.started_at).and_then(parse_timestamp),
            ended_at: field(self.indices.ended_at).and_then(parse_timestamp),
            start_station_id: parse_identifier(field(self.indices.start_station_id))?,
            start_station_name: field(self.indices.start_station_name)
                .unwrap_or(UNKNOWN_STATION_NAME)
                .to_string(),
            start_station_lat: parse_coordinate(field(self.indices.start_station_lat))?,
            start_station_lon: parse_coordinate(field(self.indices.start_station_lon))?,
            end_station_id: parse_identifier(field(self.indices.end_station_id))?,
            end_station_name: field(self.indices.end_station_name)
                .unwrap_or(UNKNOWN_STATION_NAME)
                .to_string(),
            end_station_lat: parse_coordinate(field(self.indices.end_station_lat))?,
            end_station_lon: parse_coordinate(field(self.indices.end_station_lon))?,
            bike_id: parse_identifier(field(self.indices.bike_id))?,
            bike_type: field(self.indices.bike_type)
                .map(BikeType::from_rideable_type)
                .unwrap_or_default(),
            rider_birth_year: parse_birth_year(field(self.indices.birth_year))?,
            rider_gender: field(self.indices.gender)
                .map(Gender::from_legacy_code)
                .unwrap_or_default(),
            rider_casual_or_member: field(self.indices.membership).map(str::to_string),
        };

        Ok(row)
    }
}

/// Permissive timestamp parsing across the formats the payloads have used.
/// Unparseable values yield `None` and a warning, never an error.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    warn!(value = raw, "Unparseable timestamp, storing null");
    None
}

/// Parse a station or bike identifier. Empty means "no reference", which is
/// distinct from the valid identifier 0. Payloads occasionally carry ids in
/// float form ("523.0").
fn parse_identifier(raw: Option<&str>) -> Result<Option<i64>> {
    match raw {
        None => Ok(None),
        Some(value) => {
            if let Ok(id) = value.parse::<i64>() {
                return Ok(Some(id));
            }
            value
                .parse::<f64>()
                .map(|f| Some(f as i64))
                .map_err(|_| IngestError::RowParse(format!("invalid identifier: {value:?}")))
        },
    }
}

fn parse_coordinate(raw: Option<&str>) -> Result<Option<f64>> {
    match raw {
        None => Ok(None),
        Some(value) => value
            .parse::<f64>()
            .map(Some)
            .map_err(|_| IngestError::RowParse(format!("invalid coordinate: {value:?}"))),
    }
}

/// Birth year normalization: the legacy `\N` sentinel and an absent column
/// both become 0, matching the "unknown" convention of the legacy encoding.
fn parse_birth_year(raw: Option<&str>) -> Result<i32> {
    match raw {
        None => Ok(0),
        Some(BIRTH_YEAR_SENTINEL) => Ok(0),
        Some(value) => value
            .parse::<f64>()
            .map(|y| y as i32)
            .map_err(|_| IngestError::RowParse(format!("invalid birth year: {value:?}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn legacy_headers() -> StringRecord {
        StringRecord::from(vec![
            "tripduration",
            "starttime",
            "stoptime",
            "start station id",
            "start station name",
            "start station latitude",
            "start station longitude",
            "end station id",
            "end station name",
            "end station latitude",
            "end station longitude",
            "bikeid",
            "usertype",
            "birth year",
            "gender",
        ])
    }

    fn legacy_record() -> StringRecord {
        StringRecord::from(vec![
            "680",
            "2019-01-01 00:01:47.4010",
            "2019-01-01 00:13:07.5810",
            "3160",
            "Central Park West & W 76 St",
            "40.77896784",
            "-73.97374737",
            "2283",
            "W 89 St & Columbus Ave",
            "40.78807",
            "-73.97016",
            "15839",
            "Subscriber",
            "1971",
            "1",
        ])
    }

    fn current_headers() -> StringRecord {
        StringRecord::from(vec![
            "ride_id",
            "rideable_type",
            "started_at",
            "ended_at",
            "start_station_name",
            "start_station_id",
            "end_station_name",
            "end_station_id",
            "start_lat",
            "start_lng",
            "end_lat",
            "end_lng",
            "member_casual",
        ])
    }

    fn current_record() -> StringRecord {
        StringRecord::from(vec![
            "A1B2C3D4E5F6",
            "electric_bike",
            "2021-01-05 10:00:00",
            "2021-01-05 10:20:00",
            "Broadway & W 25 St",
            "6173",
            "W 27 St & 7 Ave",
            "6427",
            "40.7441",
            "-73.9888",
            "40.7454",
            "-73.9932",
            "member",
        ])
    }

    #[test]
    fn test_schema_detection() {
        assert_eq!(SchemaKind::detect(&legacy_headers()), SchemaKind::Legacy);
        assert_eq!(SchemaKind::detect(&current_headers()), SchemaKind::Current);
    }

    #[test]
    fn test_normalize_legacy_row() {
        let normalizer = RowNormalizer::from_headers(&legacy_headers());
        let row = normalizer.normalize(&legacy_record()).unwrap();

        assert_eq!(row.ride_id, None);
        assert_eq!(row.start_station_id, Some(3160));
        assert_eq!(row.start_station_name, "Central Park West & W 76 St");
        assert_eq!(row.bike_id, Some(15839));
        assert_eq!(row.bike_type, BikeType::Unknown);
        assert_eq!(row.rider_birth_year, 1971);
        assert_eq!(row.rider_gender, Gender::Male);
        assert_eq!(row.rider_casual_or_member.as_deref(), Some("Subscriber"));
        assert!(row.started_at.is_some());
        assert!(row.ended_at.is_some());
    }

    #[test]
    fn test_normalize_current_row() {
        let normalizer = RowNormalizer::from_headers(&current_headers());
        let row = normalizer.normalize(&current_record()).unwrap();

        assert_eq!(row.ride_id.as_deref(), Some("A1B2C3D4E5F6"));
        assert_eq!(row.bike_type, BikeType::Electric);
        assert_eq!(row.bike_id, None);
        assert_eq!(row.rider_birth_year, 0);
        assert_eq!(row.rider_gender, Gender::Unknown);
        assert_eq!(row.rider_casual_or_member.as_deref(), Some("member"));
        assert_eq!(row.start_station_id, Some(6173));
        assert_eq!(row.start_station_lat, Some(40.7441));
    }

    #[test]
    fn test_birth_year_sentinel_normalizes_to_zero() {
        let mut record = legacy_record();
        let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
        fields[13] = "\\N".to_string();
        record = StringRecord::from(fields);

        let normalizer = RowNormalizer::from_headers(&legacy_headers());
        let row = normalizer.normalize(&record).unwrap();
        assert_eq!(row.rider_birth_year, 0);
    }

    #[test]
    fn test_float_form_birth_year() {
        let mut fields: Vec<String> = legacy_record().iter().map(str::to_string).collect();
        fields[13] = "1971.0".to_string();
        let record = StringRecord::from(fields);

        let normalizer = RowNormalizer::from_headers(&legacy_headers());
        assert_eq!(normalizer.normalize(&record).unwrap().rider_birth_year, 1971);
    }

    #[test]
    fn test_empty_station_id_is_no_reference() {
        let mut fields: Vec<String> = current_record().iter().map(str::to_string).collect();
        fields[5] = "".to_string();
        let record = StringRecord::from(fields);

        let normalizer = RowNormalizer::from_headers(&current_headers());
        let row = normalizer.normalize(&record).unwrap();
        assert_eq!(row.start_station_id, None);
    }

    #[test]
    fn test_zero_station_id_is_a_valid_identifier() {
        let mut fields: Vec<String> = current_record().iter().map(str::to_string).collect();
        fields[5] = "0".to_string();
        let record = StringRecord::from(fields);

        let normalizer = RowNormalizer::from_headers(&current_headers());
        let row = normalizer.normalize(&record).unwrap();
        assert_eq!(row.start_station_id, Some(0));
    }

    #[test]
    fn test_float_form_station_id() {
        let mut fields: Vec<String> = current_record().iter().map(str::to_string).collect();
        fields[5] = "523.0".to_string();
        let record = StringRecord::from(fields);

        let normalizer = RowNormalizer::from_headers(&current_headers());
        assert_eq!(
            normalizer.normalize(&record).unwrap().start_station_id,
            Some(523)
        );
    }

    #[test]
    fn test_unparseable_timestamp_becomes_null() {
        let mut fields: Vec<String> = current_record().iter().map(str::to_string).collect();
        fields[2] = "not a date".to_string();
        let record = StringRecord::from(fields);

        let normalizer = RowNormalizer::from_headers(&current_headers());
        let row = normalizer.normalize(&record).unwrap();
        assert_eq!(row.started_at, None);
        assert!(row.ended_at.is_some());
    }

    #[test]
    fn test_slash_format_timestamp() {
        let parsed = parse_timestamp("1/5/2021 10:00:00");
        assert!(parsed.is_some());
    }

    #[test]
    fn test_missing_station_name_defaults_to_unknown() {
        let mut fields: Vec<String> = current_record().iter().map(str::to_string).collect();
        fields[4] = "".to_string();
        let record = StringRecord::from(fields);

        let normalizer = RowNormalizer::from_headers(&current_headers());
        let row = normalizer.normalize(&record).unwrap();
        assert_eq!(row.start_station_name, "unknown");
    }

    #[test]
    fn test_invalid_identifier_is_a_row_error() {
        let mut fields: Vec<String> = current_record().iter().map(str::to_string).collect();
        fields[5] = "abc".to_string();
        let record = StringRecord::from(fields);

        let normalizer = RowNormalizer::from_headers(&current_headers());
        assert!(matches!(
            normalizer.normalize(&record),
            Err(IngestError::RowParse(_))
        ));
    }
}
