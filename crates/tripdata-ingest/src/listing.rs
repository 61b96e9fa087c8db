//! Remote archive listing retrieval
//!
//! Fetches the XML bucket index from the listing endpoint and parses its
//! `Contents` entries into [`ArchiveDescriptor`]s. Read-only: one GET per
//! pass, no side effects.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};
use tripdata_common::types::ArchiveDescriptor;

/// Suffix identifying candidate archives in the listing.
const ARCHIVE_SUFFIX: &str = ".zip";

/// XML document returned by the listing endpoint.
#[derive(Debug, Deserialize)]
struct ListBucketResult {
    #[serde(rename = "Contents", default)]
    contents: Vec<ContentsEntry>,
}

#[derive(Debug, Deserialize)]
struct ContentsEntry {
    #[serde(rename = "Key")]
    key: String,

    #[serde(rename = "LastModified")]
    last_modified: DateTime<Utc>,

    #[serde(rename = "Size")]
    size: i64,
}

/// Client for the remote archive index.
pub struct ListingClient {
    client: reqwest::Client,
    listing_url: String,
}

impl ListingClient {
    pub fn new(listing_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            listing_url: listing_url.into(),
        }
    }

    /// Fetch the listing and return candidate archive descriptors in the
    /// order the index reports them (no ordering by date is guaranteed).
    ///
    /// A non-success status yields [`IngestError::ListingUnavailable`]; the
    /// caller ends the pass cleanly and retries on the next invocation.
    pub async fn list_archives(&self) -> Result<Vec<ArchiveDescriptor>> {
        debug!(url = %self.listing_url, "Fetching archive listing");

        let response = self
            .client
            .get(&self.listing_url)
            .send()
            .await
            .map_err(|e| IngestError::ListingUnavailable(e.to_string()))?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Listing endpoint returned non-success status");
            return Err(IngestError::ListingUnavailable(format!(
                "status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| IngestError::ListingUnavailable(e.to_string()))?;

        parse_listing(&body)
    }
}

/// Parse the XML index document, keeping only entries with the archive
/// suffix.
fn parse_listing(body: &str) -> Result<Vec<ArchiveDescriptor>> {
    let result: ListBucketResult = quick_xml::de::from_str(body)?;

    let archives: Vec<ArchiveDescriptor> = result
        .contents
        .into_iter()
        .filter(|entry| entry.key.ends_with(ARCHIVE_SUFFIX))
        .map(|entry| ArchiveDescriptor {
            name: entry.key,
            last_modified: entry.last_modified,
            size_bytes: entry.size,
        })
        .collect();

    debug!(count = archives.len(), "Parsed archive listing");
    Ok(archives)
}
