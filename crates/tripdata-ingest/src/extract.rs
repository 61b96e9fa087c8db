//! Archive download and payload extraction
//!
//! One archive at a time: stream the zip to a scoped temp directory, unpack
//! it there, pick the first tabular payload, and move it into the staging
//! directory with a write-to-temp-then-rename step so a crash never leaves a
//! half-written staged file. The temp directory is cleaned up on every exit
//! path, including errors.

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};
use tripdata_common::types::{ArchiveDescriptor, StagingRecord};

/// Extension of tabular payload files inside an archive.
const PAYLOAD_EXTENSION: &str = ".csv";

/// Base delay for download retry backoff; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Downloads archives and extracts their payloads into the staging area.
pub struct ArchiveExtractor {
    client: reqwest::Client,
    base_url: String,
    staging_dir: PathBuf,
    download_retries: u32,
}

impl ArchiveExtractor {
    pub fn new(
        base_url: impl Into<String>,
        staging_dir: impl Into<PathBuf>,
        download_retries: u32,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            staging_dir: staging_dir.into(),
            download_retries,
        }
    }

    /// Download one archive and move its first qualifying payload into the
    /// staging directory.
    ///
    /// Archives carry exactly one relevant payload per run; additional
    /// entries are ignored. Errors here are per-file: the caller logs and
    /// skips the archive, which is retried on the next pass since it was
    /// never staged.
    pub async fn extract(&self, descriptor: &ArchiveDescriptor) -> Result<StagingRecord> {
        let workdir = tempfile::tempdir()?;
        let archive_path = workdir.path().join(&descriptor.name);

        self.download_with_retry(descriptor, &archive_path).await?;

        let payload_name = select_payload(&archive_path, workdir.path(), &self.staging_dir)?
            .ok_or_else(|| IngestError::Extraction {
                file: descriptor.name.clone(),
                reason: "archive contains no tabular payload".to_string(),
            })?;

        info!(
            archive = %descriptor.name,
            payload = %payload_name,
            "Staged payload from archive"
        );

        Ok(StagingRecord {
            local_path: self
                .staging_dir
                .join(&payload_name)
                .to_string_lossy()
                .into_owned(),
            file_name: payload_name,
            parent_archive_last_modified: descriptor.last_modified,
            size_bytes: descriptor.size_bytes,
            row_count: 0,
        })
    }

    /// Stream the archive to `target`, retrying transient network failures
    /// with exponential backoff. A non-success status is treated as
    /// permanent for this pass.
    async fn download_with_retry(
        &self,
        descriptor: &ArchiveDescriptor,
        target: &Path,
    ) -> Result<()> {
        let url = format!("{}{}", self.base_url, descriptor.name);

        let mut attempt = 0;
        loop {
            match self.download(&url, descriptor, target).await {
                Ok(()) => return Ok(()),
                Err(err @ IngestError::Extraction { .. }) => return Err(err),
                Err(err) if attempt < self.download_retries => {
                    let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(
                        archive = %descriptor.name,
                        error = %err,
                        ?delay,
                        "Download failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                },
                Err(err) => {
                    return Err(IngestError::Extraction {
                        file: descriptor.name.clone(),
                        reason: err.to_string(),
                    })
                },
            }
        }
    }

    /// Stream one download to disk, never buffering the full archive in
    /// memory.
    async fn download(
        &self,
        url: &str,
        descriptor: &ArchiveDescriptor,
        target: &Path,
    ) -> Result<()> {
        debug!(url, "Downloading archive");
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(IngestError::Extraction {
                file: descriptor.name.clone(),
                reason: format!("download returned status {}", response.status()),
            });
        }

        let total_size = response.content_length().unwrap_or(0);
        let pb = ProgressBar::new(total_size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{msg} [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        pb.set_message(format!("Downloading {}", descriptor.name));

        let mut file = std::fs::File::create(target)?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }

        pb.finish_and_clear();
        debug!(archive = %descriptor.name, bytes = downloaded, "Download complete");
        Ok(())
    }
}

/// Unpack the archive under `workdir`, find the first qualifying payload,
/// and move it into `staging_dir` atomically. Returns the staged file name,
/// or `None` when the archive holds no payload.
fn select_payload(
    archive_path: &Path,
    workdir: &Path,
    staging_dir: &Path,
) -> Result<Option<String>> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if !entry.is_file() {
            continue;
        }

        let entry_path = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => continue,
        };
        let file_name = match entry_path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n.to_string(),
            None => continue,
        };

        if !is_payload(&entry_path, &file_name) {
            continue;
        }

        debug!(entry = %file_name, "Selected payload entry");

        // Unpack to the scoped workdir first, then rename within the staging
        // directory so the staged file appears atomically.
        let unpacked = workdir.join(&file_name);
        let mut out = std::fs::File::create(&unpacked)?;
        std::io::copy(&mut entry, &mut out)?;

        std::fs::create_dir_all(staging_dir)?;
        let partial = staging_dir.join(format!(".{file_name}.part"));
        std::fs::copy(&unpacked, &partial)?;
        std::fs::rename(&partial, staging_dir.join(&file_name))?;

        return Ok(Some(file_name));
    }

    Ok(None)
}

/// Tabular payloads only: match the extension, exclude hidden and
/// resource-fork entries.
fn is_payload(entry_path: &Path, file_name: &str) -> bool {
    if !file_name.ends_with(PAYLOAD_EXTENSION) {
        return false;
    }
    if file_name.starts_with('.') || file_name.starts_with("._") {
        return false;
    }
    !entry_path
        .components()
        .any(|c| c.as_os_str() == "__MACOSX")
}
