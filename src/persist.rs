//! Shared write-temp-then-atomic-rename helper used by every on-disk store (tokens, skip
//! records, statistics, logs). Never truncate a store file in place: a crash mid-write must
//! never leave a half-written file behind.

use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::error::{Error, Result};

/// Serialize `value` as pretty JSON and atomically replace the file at `path` with it.
///
/// The temp file is created in the destination's own directory so the final `rename` is
/// guaranteed to be on the same filesystem (and therefore atomic).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        Error::Persist(format!("{} has no parent directory", path.display()))
    })?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| Error::Persist(e.to_string()))?;
    Ok(())
}

/// Write raw bytes atomically, for the non-JSON stores (the encryption key, the ciphertext
/// record). Same temp-then-rename discipline as [`write_json_atomic`].
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| {
        Error::Persist(format!("{} has no parent directory", path.display()))
    })?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| Error::Persist(e.to_string()))?;
    Ok(())
}

/// Load and parse a JSON file, returning `Ok(None)` if it simply doesn't exist yet (first
/// run) rather than treating that as an error.
pub fn read_json_opt<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
