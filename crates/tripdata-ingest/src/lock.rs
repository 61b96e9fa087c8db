//! Run-level lock
//!
//! No two pipeline passes may run concurrently against the same staging and
//! committed directories. An advisory lock file created with `create_new`
//! provides single-flight: acquisition fails while another pass holds it,
//! and dropping the guard removes the file.

use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

const LOCK_FILE_NAME: &str = "ingest.lock";

/// Guard held for the duration of one pipeline pass.
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the lock under the given staging directory.
    pub fn acquire(staging_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(staging_dir)?;
        let path = staging_dir.join(LOCK_FILE_NAME);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                debug!(lock = %path.display(), "Acquired run lock");
                Ok(Self { path })
            },
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Err(
                IngestError::PassInProgress(path.to_string_lossy().into_owned()),
            ),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "Could not remove run lock");
        }
    }
}
