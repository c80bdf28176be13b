//! The statistics aggregate (C8): daily/weekly/monthly/per-artist metrics and session
//! reconstruction, behind a single `Update` entry point.
//!
//! Grounded on the same "in-memory `Arc<RwLock<_>>` is the source of truth, disk is a
//! shadow" pattern as [`crate::skip_store`] (itself grounded on the teacher's
//! `library.rs`), plus `chrono::NaiveDate::iso_week()` for the ISO week number under the
//! standard 4th-of-January rule — chrono implements that rule directly, no hand-rolled date
//! math needed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::Result;
use crate::persist;

const MAX_SESSIONS: usize = 100;
const SESSION_GAP: i64 = 30; // minutes
const DISCOVERY_WINDOW_DAYS: i64 = 30;
const TOP_ARTISTS: usize = 10;

/// One time-bucket's rollup. Daily, weekly, and monthly metrics are keyed differently but
/// structurally identical, so they share this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodMetrics {
    pub listening_time_ms: u64,
    pub tracks_played: u32,
    pub tracks_skipped: u32,
    pub unique_artists: Vec<String>,
    pub unique_tracks: Vec<String>,
    pub peak_hour: Option<u8>,
    /// Running per-hour play counts for this bucket, used to recompute `peak_hour`
    /// incrementally. Implementation detail, not part of the documented shape.
    #[serde(default = "zero_hours")]
    hour_counts: [u32; 24],
}

fn zero_hours() -> [u32; 24] {
    [0; 24]
}

impl Default for PeriodMetrics {
    fn default() -> Self {
        Self {
            listening_time_ms: 0,
            tracks_played: 0,
            tracks_skipped: 0,
            unique_artists: Vec::new(),
            unique_tracks: Vec::new(),
            peak_hour: None,
            hour_counts: [0; 24],
        }
    }
}

impl PeriodMetrics {
    fn bump(&mut self, artist_id: &str, track_id: &str, played_ms: u32, was_skipped: bool, hour: usize) {
        self.listening_time_ms += u64::from(played_ms);
        self.tracks_played += 1;
        if was_skipped {
            self.tracks_skipped += 1;
        }
        if !self.unique_artists.iter().any(|a| a == artist_id) {
            self.unique_artists.push(artist_id.to_string());
        }
        if !self.unique_tracks.iter().any(|t| t == track_id) {
            self.unique_tracks.push(track_id.to_string());
        }
        self.hour_counts[hour] += 1;
        self.peak_hour = self
            .hour_counts
            .iter()
            .enumerate()
            .max_by_key(|(_, &count)| count)
            .filter(|(_, &count)| count > 0)
            .map(|(hour, _)| hour as u8);
    }
}

/// Running per-artist rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtistMetrics {
    pub name: String,
    pub listening_time_ms: u64,
    pub skip_rate: f64,
    pub tracks_played: u32,
    pub avg_listening_before_skip_ms: f64,
    pub most_played_track_id: Option<String>,
    pub most_skipped_track_id: Option<String>,
    /// When this artist was first observed; drives `discovery_rate`. Implementation detail.
    first_seen: DateTime<Utc>,
    /// Running play/skip counts per track, used to recompute `most_played_track_id` /
    /// `most_skipped_track_id` without rescanning history. Implementation detail.
    #[serde(default)]
    track_play_counts: HashMap<String, u32>,
    #[serde(default)]
    track_skip_counts: HashMap<String, u32>,
    #[serde(default)]
    skipped_plays: u32,
}

impl ArtistMetrics {
    fn new(name: &str, first_seen: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            listening_time_ms: 0,
            skip_rate: 0.0,
            tracks_played: 0,
            avg_listening_before_skip_ms: 0.0,
            most_played_track_id: None,
            most_skipped_track_id: None,
            first_seen,
            track_play_counts: HashMap::new(),
            track_skip_counts: HashMap::new(),
            skipped_plays: 0,
        }
    }

    fn bump(&mut self, name: &str, track_id: &str, played_ms: u32, was_skipped: bool) {
        self.name = name.to_string();
        self.tracks_played += 1;
        self.listening_time_ms += u64::from(played_ms);

        let n = f64::from(self.tracks_played);
        let outcome = if was_skipped { 1.0 } else { 0.0 };
        self.skip_rate = (self.skip_rate * (n - 1.0) + outcome) / n;

        *self.track_play_counts.entry(track_id.to_string()).or_insert(0) += 1;

        if was_skipped {
            self.skipped_plays += 1;
            let sn = f64::from(self.skipped_plays);
            self.avg_listening_before_skip_ms =
                (self.avg_listening_before_skip_ms * (sn - 1.0) + f64::from(played_ms)) / sn;
            *self.track_skip_counts.entry(track_id.to_string()).or_insert(0) += 1;
        }

        self.most_played_track_id = self
            .track_play_counts
            .iter()
            .max_by_key(|(_, &count)| count)
            .map(|(id, _)| id.clone());
        self.most_skipped_track_id = self
            .track_skip_counts
            .iter()
            .max_by_key(|(_, &count)| count)
            .map(|(id, _)| id.clone());
    }
}

/// A reconstructed listening session: a maximal run of plays with inter-play gaps `<= 30min`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub track_ids: Vec<String>,
    pub skipped_tracks: u32,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub longest_non_skip_streak: u32,
    /// The in-progress non-skip streak; needed to keep extending `longest_non_skip_streak`
    /// correctly across a process restart. Implementation detail.
    #[serde(default)]
    current_non_skip_streak: u32,
}

impl Session {
    fn open(
        track_id: &str,
        at: DateTime<Utc>,
        device_name: Option<&str>,
        device_type: Option<&str>,
        was_skipped: bool,
    ) -> Self {
        Self {
            id: format!("session-{}", at.timestamp_millis()),
            start_time: at,
            end_time: at,
            duration_ms: 0,
            track_ids: vec![track_id.to_string()],
            skipped_tracks: u32::from(was_skipped),
            device_name: device_name.map(str::to_string),
            device_type: device_type.map(str::to_string),
            longest_non_skip_streak: u32::from(!was_skipped),
            current_non_skip_streak: u32::from(!was_skipped),
        }
    }

    fn extend(
        &mut self,
        track_id: &str,
        at: DateTime<Utc>,
        device_name: Option<&str>,
        device_type: Option<&str>,
        was_skipped: bool,
    ) {
        self.end_time = at;
        self.duration_ms = (at - self.start_time).num_milliseconds();
        self.track_ids.push(track_id.to_string());
        if let Some(name) = device_name {
            self.device_name = Some(name.to_string());
        }
        if let Some(kind) = device_type {
            self.device_type = Some(kind.to_string());
        }
        if was_skipped {
            self.skipped_tracks += 1;
            self.current_non_skip_streak = 0;
        } else {
            self.current_non_skip_streak += 1;
            self.longest_non_skip_streak = self.longest_non_skip_streak.max(self.current_non_skip_streak);
        }
    }
}

/// The full aggregate document persisted to `data/statistics.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statistics {
    pub daily_metrics: BTreeMap<String, PeriodMetrics>,
    pub weekly_metrics: BTreeMap<String, PeriodMetrics>,
    pub monthly_metrics: BTreeMap<String, PeriodMetrics>,
    pub artist_metrics: HashMap<String, ArtistMetrics>,
    pub sessions: Vec<Session>,
    pub total_unique_tracks: u32,
    pub total_unique_artists: u32,
    pub overall_skip_rate: f64,
    pub discovery_rate: f64,
    pub total_listening_time_ms: u64,
    pub top_artist_ids: Vec<String>,
    pub hourly_distribution: [u32; 24],
    pub daily_distribution: [u32; 7],
    pub last_updated: DateTime<Utc>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self {
            daily_metrics: BTreeMap::new(),
            weekly_metrics: BTreeMap::new(),
            monthly_metrics: BTreeMap::new(),
            artist_metrics: HashMap::new(),
            sessions: Vec::new(),
            total_unique_tracks: 0,
            total_unique_artists: 0,
            overall_skip_rate: 0.0,
            discovery_rate: 0.0,
            total_listening_time_ms: 0,
            top_artist_ids: Vec::new(),
            hourly_distribution: [0; 24],
            daily_distribution: [0; 7],
            last_updated: DateTime::UNIX_EPOCH,
        }
    }
}

/// The statistics aggregator (C8): a single `update` entry point mutating the whole
/// [`Statistics`] document as one critical section, then persisting it atomically.
pub struct StatisticsAggregator {
    path: PathBuf,
    inner: RwLock<Statistics>,
    clock: Arc<dyn Clock>,
}

impl StatisticsAggregator {
    pub fn new(data_dir: &Path, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let path = data_dir.join("statistics.json");
        let loaded: Statistics = persist::read_json_opt(&path)?.unwrap_or_default();
        Ok(Arc::new(Self {
            path,
            inner: RwLock::new(loaded),
            clock,
        }))
    }

    pub fn snapshot(&self) -> Statistics {
        self.inner.read().clone()
    }

    /// Fold one finished play into every bucket it touches: daily/weekly/monthly metrics,
    /// per-artist rollup, session reconstruction, and the overall/discovery rates.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        track_id: &str,
        track_name: &str,
        artist_id: &str,
        artist_name: &str,
        was_skipped: bool,
        played_ms: u32,
        device_name: Option<&str>,
        device_type: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let _ = track_name; // not currently bucketed anywhere beyond the skip store (C7)
        let mut stats = self.inner.write();

        // 1. bucket keys
        let date_key = timestamp.format("%Y-%m-%d").to_string();
        let month_key = timestamp.format("%Y-%m").to_string();
        let iso_week = timestamp.date_naive().iso_week();
        let week_key = format!("{}-W{:02}", iso_week.year(), iso_week.week());
        let hour = timestamp.hour() as usize;
        let weekday = timestamp.weekday().num_days_from_monday() as usize;

        // 2. daily/weekly/monthly buckets + distributions
        stats
            .daily_metrics
            .entry(date_key)
            .or_default()
            .bump(artist_id, track_id, played_ms, was_skipped, hour);
        stats
            .weekly_metrics
            .entry(week_key)
            .or_default()
            .bump(artist_id, track_id, played_ms, was_skipped, hour);
        stats
            .monthly_metrics
            .entry(month_key)
            .or_default()
            .bump(artist_id, track_id, played_ms, was_skipped, hour);
        stats.hourly_distribution[hour] += 1;
        stats.daily_distribution[weekday] += 1;

        // 3. artist metrics
        stats
            .artist_metrics
            .entry(artist_id.to_string())
            .or_insert_with(|| ArtistMetrics::new(artist_name, timestamp))
            .bump(artist_name, track_id, played_ms, was_skipped);

        // 4. scalars
        let mut seen_tracks: HashSet<&str> = HashSet::new();
        for artist in stats.artist_metrics.values() {
            seen_tracks.extend(artist.track_play_counts.keys().map(String::as_str));
        }
        stats.total_unique_tracks = seen_tracks.len() as u32;
        stats.total_unique_artists = stats.artist_metrics.len() as u32;

        let total_played: u64 = stats.daily_metrics.values().map(|d| u64::from(d.tracks_played)).sum();
        let total_skipped: u64 = stats.daily_metrics.values().map(|d| u64::from(d.tracks_skipped)).sum();
        stats.overall_skip_rate = total_skipped as f64 / (total_played.max(1) as f64);

        stats.total_listening_time_ms += u64::from(played_ms);

        let mut by_listening_time: Vec<(String, u64)> = stats
            .artist_metrics
            .iter()
            .map(|(id, artist)| (id.clone(), artist.listening_time_ms))
            .collect();
        by_listening_time.sort_by(|a, b| b.1.cmp(&a.1));
        stats.top_artist_ids = by_listening_time.into_iter().take(TOP_ARTISTS).map(|(id, _)| id).collect();

        // 5. discovery rate
        let window_start = timestamp - Duration::days(DISCOVERY_WINDOW_DAYS);
        let discovered = stats
            .artist_metrics
            .values()
            .filter(|artist| artist.first_seen >= window_start)
            .count();
        stats.discovery_rate = if stats.total_unique_artists > 0 {
            discovered as f64 / f64::from(stats.total_unique_artists)
        } else {
            0.0
        };

        // 6. session merging
        let extends_last = stats
            .sessions
            .last()
            .is_some_and(|session| (timestamp - session.end_time) <= Duration::minutes(SESSION_GAP));
        if extends_last {
            stats
                .sessions
                .last_mut()
                .expect("checked above")
                .extend(track_id, timestamp, device_name, device_type, was_skipped);
        } else {
            stats.sessions.push(Session::open(track_id, timestamp, device_name, device_type, was_skipped));
            if stats.sessions.len() > MAX_SESSIONS {
                stats.sessions.remove(0);
            }
        }

        // 7. finalize
        stats.last_updated = timestamp;
        let snapshot = stats.clone();
        drop(stats);
        persist::write_json_atomic(&self.path, &snapshot)
    }

    pub fn clear(&self) -> Result<()> {
        let mut stats = self.inner.write();
        *stats = Statistics {
            last_updated: self.clock.now(),
            ..Statistics::default()
        };
        let snapshot = stats.clone();
        drop(stats);
        persist::write_json_atomic(&self.path, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn aggregator(dir: &std::path::Path) -> Arc<StatisticsAggregator> {
        StatisticsAggregator::new(dir, Arc::new(SystemClock)).unwrap()
    }

    fn at(minutes_from_epoch: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + Duration::minutes(minutes_from_epoch)
    }

    #[test]
    fn overall_skip_rate_matches_aggregate_definition() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        agg.update("t1", "A", "ar1", "Artist", true, 10_000, None, None, at(0)).unwrap();
        agg.update("t2", "B", "ar1", "Artist", false, 20_000, None, None, at(1)).unwrap();
        agg.update("t3", "C", "ar1", "Artist", false, 20_000, None, None, at(2)).unwrap();

        let stats = agg.snapshot();
        assert!((stats.overall_skip_rate - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn distributions_have_fixed_length() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());
        agg.update("t1", "A", "ar1", "Artist", false, 1000, None, None, at(0)).unwrap();

        let stats = agg.snapshot();
        assert_eq!(stats.hourly_distribution.len(), 24);
        assert_eq!(stats.daily_distribution.len(), 7);
    }

    #[test]
    fn sessions_merge_within_gap_and_split_beyond_it() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        agg.update("t1", "A", "ar1", "Artist", false, 1000, None, None, at(0)).unwrap();
        agg.update("t2", "B", "ar1", "Artist", false, 1000, None, None, at(5)).unwrap();
        agg.update("t3", "C", "ar1", "Artist", false, 1000, None, None, at(45)).unwrap();

        let stats = agg.snapshot();
        assert_eq!(stats.sessions.len(), 2);
        assert_eq!(stats.sessions[0].track_ids, vec!["t1", "t2"]);
        assert_eq!(stats.sessions[1].track_ids, vec!["t3"]);
    }

    #[test]
    fn session_list_is_capped_at_one_hundred() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        for i in 0..105 {
            agg.update("t", "T", "ar1", "Artist", false, 1000, None, None, at(i * 60)).unwrap();
        }

        let stats = agg.snapshot();
        assert_eq!(stats.sessions.len(), 100);
    }

    #[test]
    fn artist_skip_rate_tracks_running_average() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());

        agg.update("t1", "A", "ar1", "Artist", true, 1000, None, None, at(0)).unwrap();
        agg.update("t2", "B", "ar1", "Artist", true, 1000, None, None, at(1)).unwrap();
        agg.update("t3", "C", "ar1", "Artist", false, 1000, None, None, at(2)).unwrap();

        let stats = agg.snapshot();
        let artist = stats.artist_metrics.get("ar1").unwrap();
        assert!((artist.skip_rate - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn clear_resets_to_default_shape() {
        let dir = tempfile::tempdir().unwrap();
        let agg = aggregator(dir.path());
        agg.update("t1", "A", "ar1", "Artist", false, 1000, None, None, at(0)).unwrap();

        agg.clear().unwrap();
        let stats = agg.snapshot();
        assert_eq!(stats.total_unique_tracks, 0);
        assert!(stats.sessions.is_empty());
    }
}
