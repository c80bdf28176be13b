//! Persistent skip/completion counters, keyed by trackId (C7).
//!
//! Grounded on the teacher's `library.rs` load_cache/save_cache split: an in-memory map is
//! the source of truth for the process lifetime, the file on disk is a shadow rewritten in
//! full on every mutation, generalized from a `Vec` to a `HashMap` because lookups here are
//! by trackId rather than a sequential scan, and upgraded to the shared atomic-write helper
//! so a crash mid-write can never leave a truncated, half-written file on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persist;

/// One skip event: when it happened and how far into the track the user got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipEvent {
    pub ts: DateTime<Utc>,
    pub progress_fraction: f64,
}

/// Persistent skip/completion counters for a single track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipRecord {
    pub id: String,
    pub name: String,
    pub artist: String,
    pub skip_count: u32,
    pub not_skipped_count: u32,
    pub last_skipped_at: Option<DateTime<Utc>>,
    pub skip_timestamps: Vec<DateTime<Utc>>,
    pub skip_events: Vec<SkipEvent>,
}

impl SkipRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            artist: artist.into(),
            skip_count: 0,
            not_skipped_count: 0,
            last_skipped_at: None,
            skip_timestamps: Vec::new(),
            skip_events: Vec::new(),
        }
    }
}

/// Persistent map `trackId -> SkipRecord` (C7). The in-memory map is the source of truth;
/// every mutating call rewrites `skipped-tracks.json` in full via the shared atomic-write
/// helper. Concurrent writers (only the monitor, in practice) are serialized by the
/// `RwLock`'s write half.
pub struct SkipRecordStore {
    path: PathBuf,
    records: RwLock<HashMap<String, SkipRecord>>,
}

impl SkipRecordStore {
    pub fn new(data_dir: &Path) -> Result<Arc<Self>> {
        let path = data_dir.join("skipped-tracks.json");
        let loaded: Vec<SkipRecord> = persist::read_json_opt(&path)?.unwrap_or_default();
        let records = loaded.into_iter().map(|r| (r.id.clone(), r)).collect();
        Ok(Arc::new(Self {
            path,
            records: RwLock::new(records),
        }))
    }

    pub fn get(&self, id: &str) -> Option<SkipRecord> {
        self.records.read().get(id).cloned()
    }

    pub fn get_all(&self) -> Vec<SkipRecord> {
        let records = self.records.read();
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Merge a skip occurrence into the record for `id`: `skip_count += 1`,
    /// `last_skipped_at = max(existing, at)`, `at`/`progress_fraction` appended to the
    /// timestamp/event logs. Returns the record after merging, so the caller (the monitor)
    /// can check the resulting count against `settings.skip_threshold` without a second read.
    pub fn update_skipped(
        &self,
        id: &str,
        name: &str,
        artist: &str,
        at: DateTime<Utc>,
        progress_fraction: f64,
    ) -> Result<SkipRecord> {
        let mut records = self.records.write();
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| SkipRecord::new(id, name, artist));

        record.name = name.to_string();
        record.artist = artist.to_string();
        record.skip_count += 1;
        record.last_skipped_at = Some(match record.last_skipped_at {
            Some(existing) => existing.max(at),
            None => at,
        });
        record.skip_timestamps.push(at);
        record.skip_events.push(SkipEvent { ts: at, progress_fraction });

        let updated = record.clone();
        self.persist_locked(&records)?;
        Ok(updated)
    }

    /// Merge a completion (non-skip) into the record for `id`.
    pub fn update_not_skipped(&self, id: &str, name: &str, artist: &str) -> Result<SkipRecord> {
        let mut records = self.records.write();
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| SkipRecord::new(id, name, artist));

        record.name = name.to_string();
        record.artist = artist.to_string();
        record.not_skipped_count += 1;

        let updated = record.clone();
        self.persist_locked(&records)?;
        Ok(updated)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let mut records = self.records.write();
        records.remove(id);
        self.persist_locked(&records)
    }

    /// Replace the entire store contents, e.g. when a shell-side edit to a record
    /// (`UpdateSkippedTrack`) needs to be written back verbatim.
    pub fn save_all(&self, records: Vec<SkipRecord>) -> Result<()> {
        let mut guard = self.records.write();
        *guard = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        self.persist_locked(&guard)
    }

    pub fn clear(&self) -> Result<()> {
        let mut records = self.records.write();
        records.clear();
        self.persist_locked(&records)
    }

    fn persist_locked(&self, records: &HashMap<String, SkipRecord>) -> Result<()> {
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        persist::write_json_atomic(&self.path, &all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    #[test]
    fn skip_then_another_skip_accumulates_monotonically() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkipRecordStore::new(dir.path()).unwrap();

        store.update_skipped("t1", "Name", "Artist", epoch(100), 0.2).unwrap();
        let record = store.update_skipped("t1", "Name", "Artist", epoch(200), 0.3).unwrap();

        assert_eq!(record.skip_count, 2);
        assert_eq!(record.last_skipped_at, Some(epoch(200)));
        assert_eq!(record.skip_timestamps.len(), 2);
        assert_eq!(record.skip_events.len(), 2);
    }

    #[test]
    fn last_skipped_at_is_the_max_not_the_latest_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkipRecordStore::new(dir.path()).unwrap();

        store.update_skipped("t1", "Name", "Artist", epoch(500), 0.1).unwrap();
        let record = store.update_skipped("t1", "Name", "Artist", epoch(100), 0.1).unwrap();

        assert_eq!(record.last_skipped_at, Some(epoch(500)));
    }

    #[test]
    fn not_skipped_does_not_affect_skip_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkipRecordStore::new(dir.path()).unwrap();

        store.update_skipped("t1", "Name", "Artist", epoch(1), 0.1).unwrap();
        let record = store.update_not_skipped("t1", "Name", "Artist").unwrap();

        assert_eq!(record.skip_count, 1);
        assert_eq!(record.not_skipped_count, 1);
    }

    #[test]
    fn store_reloads_persisted_records_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SkipRecordStore::new(dir.path()).unwrap();
            store.update_skipped("t1", "Name", "Artist", epoch(1), 0.1).unwrap();
        }

        let store = SkipRecordStore::new(dir.path()).unwrap();
        assert_eq!(store.get("t1").unwrap().skip_count, 1);
    }

    #[test]
    fn remove_drops_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkipRecordStore::new(dir.path()).unwrap();
        store.update_skipped("t1", "Name", "Artist", epoch(1), 0.1).unwrap();
        store.remove("t1").unwrap();
        assert!(store.get("t1").is_none());
    }

    #[test]
    fn clear_empties_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SkipRecordStore::new(dir.path()).unwrap();
        store.update_skipped("t1", "Name", "Artist", epoch(1), 0.1).unwrap();
        store.clear().unwrap();
        assert!(store.get_all().is_empty());
    }
}
