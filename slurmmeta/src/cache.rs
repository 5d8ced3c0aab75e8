// File cache for the snapshot computed from slurmctld.
//
// Querying slurmctld for every job on every batch is too expensive for the controller, so the
// snapshot is kept in a JSON file and reused while the file is younger than the configured
// duration.  The freshness is the file's modification time; there is no other metadata.
//
// The cache outlives jobs: for up to `cache_duration` seconds at the start and end of a job its GPUs
// will be attributed to the previous state.  Jobs rarely use the GPUs in those windows.
//
// Concurrent writers are not synchronized, the last rename wins.

use crate::dates::{self, Clock};
use crate::{Result, Snapshot};

use chrono::Duration;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tracing::debug;

/// Return the contents of the cache file if it exists and is fresh.
///
/// Returns `None` if the file does not exist, if `ttl_secs` is zero, or if the file is older than
/// `ttl_secs` seconds at the time given by `clock`.  Other I/O errors are returned.

pub fn read_cache(path: &Path, ttl_secs: u64, clock: &dyn Clock) -> Result<Option<String>> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("cache {} does not exist", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if ttl_secs == 0 {
        return Ok(None);
    }

    let age = clock.now() - dates::from_system_time(metadata.modified()?);
    if age > Duration::seconds(ttl_secs.min(i64::MAX as u64 / 1000) as i64) {
        debug!("cache {} is stale ({}s old)", path.display(), age.num_seconds());
        return Ok(None);
    }

    match fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        // Removed between stat and read, treat as absent.
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Return the cached snapshot if the cache is fresh.  Undecodable contents are an error.

pub fn read_snapshot(path: &Path, ttl_secs: u64, clock: &dyn Clock) -> Result<Option<Snapshot>> {
    match read_cache(path, ttl_secs, clock)? {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

/// Write the snapshot to the cache file, creating missing parent directories.
///
/// The data are written to a fresh sibling temporary file that is then renamed over `path`, so
/// readers see either the old or the new contents, never a partial file, and concurrent writers do
/// not share a temporary file.

pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let data = serde_json::to_vec(snapshot)?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir)?;
            dir
        }
        _ => Path::new("."),
    };

    // Uniquely named and mode 0600; removed again if it is dropped before being persisted.
    let mut tmp = tempfile::Builder::new().prefix(".slurm_metadata").suffix(".tmp").tempfile_in(dir)?;
    tmp.write_all(&data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    debug!("wrote {} gpu entries to cache {}", snapshot.len(), path.display());
    Ok(())
}
