//! The playback monitor (C6): polls current playback, runs the skip/completion state
//! machine, and emits interpolated progress snapshots for a shell's UI between polls.
//!
//! Grounded on the teacher's `spotify_worker.rs::Worker::run_loop` — a single `tokio::select!`
//! loop over a command channel and one or more `tokio::time::interval` ticks, with a
//! `Pin<Box<dyn Future>>` slot for a long-running side task (there, a mercury token fetch;
//! here, nothing occupies that slot, the poll itself is awaited inline since only one poll
//! may be in flight at a time per spec §4.6). The PollTask/TickTask algorithms and the
//! skip/completion rule in `handle_track_change` are a direct translation of spec §4.6.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::api::{Adapter, PlaybackSnapshot, TrackMeta};
use crate::clock::Clock;
use crate::config::Settings;
use crate::error::Error;
use crate::events::{AuthStatus, Event, EventBus};
use crate::skip_store::SkipRecordStore;
use crate::statistics::StatisticsAggregator;

const POLL_PERIOD: Duration = Duration::from_millis(1000);
const TICK_PERIOD: Duration = Duration::from_millis(250);
/// How many recently-seen tracks suppress skip accounting, so revisiting a track the user
/// just played (e.g. hitting "previous") is never mistaken for a fresh skip.
const RECENT_TRACKS_LEN: usize = 5;
/// `P` in spec §4.6: a pause of at least this long before a track change means "paused, then
/// changed", not a skip.
const PAUSE_GRACE: Duration = Duration::from_secs(15);
/// How many recently-played rows to fetch to seed/refresh `recent_track_ids` (spec §4.6,
/// "Recent-tracks refresh").
const RECENTLY_PLAYED_LIMIT: u32 = 10;
/// Re-emit a "now playing" log for the same track after this long, so a long-running track
/// isn't silent for its whole duration.
const NOW_PLAYING_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// The outcome of [`Monitor::handle_track_change`], used by tests and the dispatch log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackChangeOutcome {
    Skipped,
    PausedThenChanged,
    Completed,
    Suppressed,
}

/// Internal, monitor-owned state (§3 `MonitorState`). Reset to its `Default` whenever
/// nothing is playing, except `recent_track_ids`, which is preserved across an empty tick.
struct MonitorState {
    current_track_id: Option<String>,
    current_track_meta: Option<TrackMeta>,
    artist_id: Option<String>,
    progress_ms: u32,
    duration_ms: u32,
    is_playing: bool,
    last_sync: DateTime<Utc>,
    recent_track_ids: Vec<String>,
    is_paused_since: Option<DateTime<Utc>>,
    total_paused: Duration,
    library_status_logged: bool,
    in_library: bool,
    last_now_playing_log_at: Option<(String, DateTime<Utc>)>,
    device_name: Option<String>,
    device_type: Option<String>,
}

impl MonitorState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_track_id: None,
            current_track_meta: None,
            artist_id: None,
            progress_ms: 0,
            duration_ms: 0,
            is_playing: false,
            last_sync: now,
            recent_track_ids: Vec::new(),
            is_paused_since: None,
            total_paused: Duration::ZERO,
            library_status_logged: false,
            in_library: false,
            last_now_playing_log_at: None,
            device_name: None,
            device_type: None,
        }
    }

    /// Reset to "nothing playing", preserving `recent_track_ids` (spec §4.6 step 1).
    fn reset_keep_recent(&mut self, now: DateTime<Utc>) {
        let recent = std::mem::take(&mut self.recent_track_ids);
        *self = Self::new(now);
        self.recent_track_ids = recent;
    }

    fn remember_recent(&mut self, track_id: String) {
        self.recent_track_ids.retain(|id| id != &track_id);
        self.recent_track_ids.insert(0, track_id);
        self.recent_track_ids.truncate(RECENT_TRACKS_LEN);
    }
}

/// Commands accepted by the monitor's own loop, distinct from the bus-level [`crate::events::Command`]
/// (those are translated 1:1 by [`crate::core::Core::dispatch`]).
pub enum MonitorCommand {
    Start,
    Stop,
}

/// The playback monitor (C6): owns [`MonitorState`] and runs the cooperative PollTask/TickTask
/// loop described in spec §4.6.
pub struct Monitor {
    adapter: Arc<Adapter>,
    skip_store: Arc<SkipRecordStore>,
    statistics: Arc<StatisticsAggregator>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    settings: Arc<std::sync::RwLock<Settings>>,
    state: Mutex<MonitorState>,
    poll_in_flight: AtomicBool,
    running: AtomicBool,
    /// Set once a refresh failure (or an upstream call that exhausts the client's own
    /// 401-retry) shows the stored tokens no longer work. PollTask short-circuits while this
    /// is set; cleared by [`Monitor::resume_after_auth`] once a fresh authorization completes.
    auth_paused: AtomicBool,
}

impl Monitor {
    pub fn new(
        adapter: Arc<Adapter>,
        skip_store: Arc<SkipRecordStore>,
        statistics: Arc<StatisticsAggregator>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        settings: Arc<std::sync::RwLock<Settings>>,
    ) -> Arc<Self> {
        let now = clock.now();
        Arc::new(Self {
            adapter,
            skip_store,
            statistics,
            events,
            clock,
            settings,
            state: Mutex::new(MonitorState::new(now)),
            poll_in_flight: AtomicBool::new(false),
            running: AtomicBool::new(false),
            auth_paused: AtomicBool::new(false),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// True once polling has been suspended following a repeated auth failure (spec §4.6
    /// failure semantics).
    pub fn is_auth_paused(&self) -> bool {
        self.auth_paused.load(Ordering::SeqCst)
    }

    /// Resume polling after a fresh authorization has completed. Idempotent.
    pub fn resume_after_auth(&self) {
        self.auth_paused.store(false, Ordering::SeqCst);
    }

    /// A refresh failure, a missing refresh token, or an upstream call that has already
    /// exhausted the HTTP client's own single 401-retry, means the stored tokens are no
    /// longer usable for anything.
    fn is_auth_failure(err: &Error) -> bool {
        matches!(err, Error::RefreshFailed(_) | Error::Unauthorized | Error::NoRefreshToken)
    }

    /// Spec §4.6/§7: surface `authStatusChanged(unauthenticated)` on the bus and suspend
    /// polling until [`Monitor::resume_after_auth`] is called. Only publishes once per
    /// failure episode, so a poll tick that keeps failing while paused doesn't spam the bus.
    fn handle_auth_failure(&self) {
        if !self.auth_paused.swap(true, Ordering::SeqCst) {
            log::error!("repeated auth failure, pausing playback monitoring until re-authorization");
            self.events.publish(Event::AuthStatusChanged(AuthStatus::Unauthenticated));
        }
    }

    fn settings_snapshot(&self) -> Settings {
        self.settings.read().unwrap().clone()
    }

    /// Spawn the monitor's cooperative loop. Returns the `mpsc::Sender` used to stop it;
    /// dropping/sending `MonitorCommand::Stop` ends the task after its current iteration.
    pub fn spawn(self: Arc<Self>) -> (tokio::task::JoinHandle<()>, mpsc::UnboundedSender<MonitorCommand>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            let mut poll_tick = tokio::time::interval(POLL_PERIOD);
            let mut ui_tick = tokio::time::interval(TICK_PERIOD);
            // Seed recent tracks from upstream history before the first poll (spec §4.6).
            self.refresh_recent_tracks().await;

            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(MonitorCommand::Stop) | None => break,
                        Some(MonitorCommand::Start) => {}
                    },
                    _ = poll_tick.tick() => {
                        if self.poll_in_flight.swap(true, Ordering::SeqCst) {
                            // Previous poll still in flight: this tick is skipped (spec §4.6).
                            continue;
                        }
                        self.poll().await;
                        self.poll_in_flight.store(false, Ordering::SeqCst);
                    },
                    _ = ui_tick.tick() => {
                        self.tick().await;
                    },
                }
            }

            self.running.store(false, Ordering::SeqCst);
        });

        (handle, tx)
    }

    /// `RecentlyPlayed` overlay described in spec §4.6: fetched at startup and after every
    /// track change so history the upstream observed before this process started is picked up.
    async fn refresh_recent_tracks(&self) {
        match self.adapter.recently_played(RECENTLY_PLAYED_LIMIT).await {
            Ok(items) => {
                let mut state = self.state.lock().await;
                for item in items {
                    if !state.recent_track_ids.contains(&item.track_id) {
                        state.recent_track_ids.push(item.track_id);
                    }
                }
            }
            Err(e) => log::warn!("could not refresh recently-played overlay: {e}"),
        }
    }

    /// PollTask (spec §4.6).
    async fn poll(&self) {
        if self.auth_paused.load(Ordering::SeqCst) {
            return;
        }

        let now = self.clock.now();

        let playback = match self.adapter.current_playback().await {
            Ok(playback) => playback,
            Err(e) => {
                if Self::is_auth_failure(&e) {
                    self.handle_auth_failure();
                } else {
                    log::error!("playback poll failed: {e}");
                }
                return;
            }
        };

        // `current_playback` returns `None` only for "no active device"/no item (HTTP 204 or
        // an absent `item`); a paused player still has an `item` and comes back here with
        // `is_playing:false`, so only the true "nothing playing" case resets state.
        let Some(mut snapshot) = playback else {
            let mut state = self.state.lock().await;
            state.reset_keep_recent(now);
            drop(state);
            self.events.publish(Event::PlaybackUpdate(PlaybackSnapshot::empty()));
            return;
        };

        let Some(track_id) = snapshot.track_id.clone() else {
            let mut state = self.state.lock().await;
            state.reset_keep_recent(now);
            drop(state);
            self.events.publish(Event::PlaybackUpdate(PlaybackSnapshot::empty()));
            return;
        };

        let mut state = self.state.lock().await;

        // Pause edges (spec §4.6 step 2).
        if state.is_playing && !snapshot.is_playing {
            state.is_paused_since = Some(now);
            log::debug!("playback paused");
        } else if !state.is_playing && snapshot.is_playing {
            if let Some(paused_since) = state.is_paused_since.take() {
                state.total_paused += (now - paused_since).to_std().unwrap_or_default();
            }
            log::debug!("playback resumed");
        }

        // Library membership, silent (hot loop) per spec §4.6 step 3.
        let in_library = match self.adapter.in_library(&track_id, true).await {
            Ok(v) => v,
            Err(e) => {
                if Self::is_auth_failure(&e) {
                    self.handle_auth_failure();
                }
                false
            }
        };
        snapshot.in_library = in_library;

        // Track change detection (spec §4.6 step 4).
        let track_changed = state
            .current_track_id
            .as_ref()
            .is_some_and(|current| current != &track_id);

        if track_changed {
            drop(state);
            self.handle_track_change(&track_id, now).await;
            state = self.state.lock().await;
            state.library_status_logged = false;
        }

        if in_library && !state.library_status_logged {
            log::info!("track {track_id} is in library");
            state.library_status_logged = true;
        }

        let should_log_now_playing = match &state.last_now_playing_log_at {
            None => true,
            Some((last_id, _)) if last_id != &track_id => true,
            Some((_, at)) => (now - *at) >= chrono::Duration::from_std(NOW_PLAYING_LOG_INTERVAL).unwrap(),
        } || !state.recent_track_ids.contains(&track_id);

        if should_log_now_playing {
            log::info!(
                "now playing: {} by {}",
                snapshot.track_name.as_deref().unwrap_or("?"),
                snapshot.artist_name.as_deref().unwrap_or("?")
            );
            state.last_now_playing_log_at = Some((track_id.clone(), now));
        }

        state.current_track_id = Some(track_id.clone());
        state.current_track_meta = Some(TrackMeta {
            id: track_id.clone(),
            name: snapshot.track_name.clone().unwrap_or_default(),
            artist_id: String::new(),
            artist_name: snapshot.artist_name.clone().unwrap_or_default(),
            album_name: snapshot.album_name.clone().unwrap_or_default(),
            album_art: snapshot.album_art.clone(),
            duration_ms: snapshot.duration_ms,
        });
        state.progress_ms = snapshot.progress_ms;
        state.duration_ms = snapshot.duration_ms;
        state.is_playing = snapshot.is_playing;
        state.last_sync = now;
        state.in_library = in_library;
        state.device_name = snapshot.device_id.clone();
        state.device_type = snapshot.device_type.clone();
        drop(state);

        self.events.publish(Event::PlaybackUpdate(snapshot));
    }

    /// TickTask (spec §4.6): interpolate progress between polls, no I/O.
    async fn tick(&self) {
        let state = self.state.lock().await;
        if !state.is_playing || state.duration_ms == 0 {
            return;
        }
        let elapsed = (self.clock.now() - state.last_sync).num_milliseconds().max(0) as u32;
        let interpolated = (state.progress_ms + elapsed).min(state.duration_ms);
        let meta = state.current_track_meta.clone();
        let snapshot = PlaybackSnapshot {
            is_playing: true,
            track_id: state.current_track_id.clone(),
            track_name: meta.as_ref().map(|m| m.name.clone()),
            artist_name: meta.as_ref().map(|m| m.artist_name.clone()),
            album_name: meta.as_ref().map(|m| m.album_name.clone()),
            album_art: meta.as_ref().and_then(|m| m.album_art.clone()),
            progress_ms: interpolated,
            duration_ms: state.duration_ms,
            device_id: state.device_name.clone(),
            device_type: state.device_type.clone(),
            in_library: state.in_library,
        };
        drop(state);
        self.events.publish(Event::PlaybackUpdate(snapshot));
    }

    /// `HandleTrackChange` (spec §4.6): the skip/completion rule. `new_track_id` is the track
    /// that just started; the accounting applies to the track that was previously playing.
    async fn handle_track_change(&self, new_track_id: &str, now: DateTime<Utc>) -> TrackChangeOutcome {
        let settings = self.settings_snapshot();
        let mut state = self.state.lock().await;

        let Some(previous_id) = state.current_track_id.clone() else {
            return TrackChangeOutcome::Suppressed;
        };
        let previous_meta = state.current_track_meta.clone();

        if state.recent_track_ids.contains(&new_track_id.to_string()) {
            state.remember_recent(previous_id);
            state.is_paused_since = None;
            state.total_paused = Duration::ZERO;
            return TrackChangeOutcome::Suppressed;
        }

        let fraction_played = if state.duration_ms > 0 {
            f64::from(state.progress_ms) / f64::from(state.duration_ms)
        } else {
            1.0
        };
        let pause_duration = state.total_paused
            + state
                .is_paused_since
                .map(|since| (now - since).to_std().unwrap_or_default())
                .unwrap_or_default();

        let threshold = settings.skip_progress_fraction();
        let was_below_threshold = fraction_played < threshold;
        let was_paused_through = pause_duration >= PAUSE_GRACE;

        let outcome = if was_below_threshold && !was_paused_through {
            TrackChangeOutcome::Skipped
        } else if was_below_threshold && was_paused_through {
            TrackChangeOutcome::PausedThenChanged
        } else {
            TrackChangeOutcome::Completed
        };

        let in_library = state.in_library;
        let progress_ms = state.progress_ms;
        let device_name = state.device_name.clone();
        let device_type = state.device_type.clone();
        state.remember_recent(previous_id.clone());
        state.is_paused_since = None;
        state.total_paused = Duration::ZERO;
        drop(state);

        let name = previous_meta.as_ref().map(|m| m.name.clone()).unwrap_or_default();
        let artist_name = previous_meta.as_ref().map(|m| m.artist_name.clone()).unwrap_or_default();
        let artist_id = previous_meta
            .as_ref()
            .map(|m| m.artist_id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| artist_name.clone());

        match outcome {
            TrackChangeOutcome::Skipped => {
                if in_library {
                    match self.skip_store.update_skipped(&previous_id, &name, &artist_name, now, fraction_played) {
                        Ok(record) => {
                            log::info!("skipped: {name} by {artist_name} ({:.0}%)", fraction_played * 100.0);
                            self.events.publish(Event::TrackSkipped(record.clone()));
                            if record.skip_count >= settings.skip_threshold {
                                self.remove_from_library_with_refresh(&previous_id).await;
                            }
                        }
                        Err(e) => log::error!("could not persist skip for {previous_id}: {e}"),
                    }
                }
                if let Err(e) = self.statistics.update(
                    &previous_id,
                    &name,
                    &artist_id,
                    &artist_name,
                    true,
                    progress_ms,
                    device_name.as_deref(),
                    device_type.as_deref(),
                    now,
                ) {
                    log::error!("could not update statistics for {previous_id}: {e}");
                }
            }
            TrackChangeOutcome::PausedThenChanged => {
                log::info!("Track change after pause: {name} by {artist_name}");
            }
            TrackChangeOutcome::Completed => {
                if in_library {
                    if let Err(e) = self.skip_store.update_not_skipped(&previous_id, &name, &artist_name) {
                        log::error!("could not persist completion for {previous_id}: {e}");
                    }
                }
                if let Err(e) = self.statistics.update(
                    &previous_id,
                    &name,
                    &artist_id,
                    &artist_name,
                    false,
                    progress_ms,
                    device_name.as_deref(),
                    device_type.as_deref(),
                    now,
                ) {
                    log::error!("could not update statistics for {previous_id}: {e}");
                }
            }
            TrackChangeOutcome::Suppressed => unreachable!("handled above"),
        }

        self.events.publish(Event::TrackChanged(previous_meta));
        self.refresh_recent_tracks().await;
        outcome
    }

    /// `RemoveFromLibrary` (spec §4.6 HandleTrackChange). The client's own request pipeline
    /// already recovers transparently from a single 401 by refreshing and retrying once
    /// (spec §4.4); this only has to handle the outcome, not re-implement the rescue.
    async fn remove_from_library_with_refresh(&self, track_id: &str) {
        match self.adapter.remove_from_library(track_id).await {
            Ok(true) => log::info!("removed {track_id} from library (skip threshold reached)"),
            Ok(false) => log::warn!("could not remove {track_id} from library: no active device"),
            Err(e) => {
                if Self::is_auth_failure(&e) {
                    self.handle_auth_failure();
                } else {
                    log::error!("could not remove {track_id} from library: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::credentials::CredentialStore;
    use crate::http_client::HttpClient;
    use crate::token_manager::TokenManager;
    use crate::token_store::TokenStore;
    use std::sync::RwLock as StdRwLock;

    fn epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn test_monitor(dir: &std::path::Path, clock: Arc<dyn Clock>) -> Arc<Monitor> {
        let tokens = Arc::new(TokenManager::new(
            TokenStore::new(dir),
            Arc::new(CredentialStore::new()),
            clock.clone(),
        ));
        let http = Arc::new(HttpClient::new(tokens.clone(), Default::default()));
        let adapter = Arc::new(Adapter::new(http, tokens));
        let skip_store = SkipRecordStore::new(dir).unwrap();
        let statistics = StatisticsAggregator::new(dir, clock.clone()).unwrap();
        let events = EventBus::new();
        let settings = Arc::new(StdRwLock::new(Settings::default()));
        Monitor::new(adapter, skip_store, statistics, events, clock, settings)
    }

    /// Builds a monitor whose adapter is authenticated and pointed at `api_base` instead of
    /// the real Spotify API, so `remove_from_library_with_refresh` can be exercised against a
    /// local mock server.
    async fn test_monitor_with_api_base(dir: &std::path::Path, clock: Arc<dyn Clock>, api_base: &str) -> Arc<Monitor> {
        let tokens = Arc::new(TokenManager::new(
            TokenStore::new(dir),
            Arc::new(CredentialStore::new()),
            clock.clone(),
        ));
        tokens.set("access-token".into(), Some("refresh-token".into()), 3600).await.unwrap();
        let http = Arc::new(HttpClient::new(tokens.clone(), Default::default()));
        let adapter = Arc::new(Adapter::new(http, tokens).with_api_base(api_base));
        let skip_store = SkipRecordStore::new(dir).unwrap();
        let statistics = StatisticsAggregator::new(dir, clock.clone()).unwrap();
        let events = EventBus::new();
        let settings = Arc::new(StdRwLock::new(Settings::default()));
        Monitor::new(adapter, skip_store, statistics, events, clock, settings)
    }

    #[tokio::test]
    async fn suppressed_when_current_track_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(TestClock::new(epoch()));
        let monitor = test_monitor(dir.path(), clock.clone());

        let outcome = monitor.handle_track_change("new-track", clock.now()).await;
        assert_eq!(outcome, TrackChangeOutcome::Suppressed);
    }

    #[tokio::test]
    async fn revisiting_a_recent_track_suppresses_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(TestClock::new(epoch()));
        let monitor = test_monitor(dir.path(), clock.clone());

        {
            let mut state = monitor.state.lock().await;
            state.current_track_id = Some("a".into());
            state.current_track_meta = Some(TrackMeta {
                id: "a".into(),
                name: "A".into(),
                artist_id: "ar".into(),
                artist_name: "Artist".into(),
                album_name: "Album".into(),
                album_art: None,
                duration_ms: 200_000,
            });
            state.progress_ms = 60_000;
            state.duration_ms = 200_000;
            state.recent_track_ids = vec!["b".into()];
        }

        let outcome = monitor.handle_track_change("b", clock.now()).await;
        assert_eq!(outcome, TrackChangeOutcome::Suppressed);
        assert!(monitor.skip_store.get("a").is_none());
    }

    #[tokio::test]
    async fn low_progress_without_pause_is_a_skip() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(TestClock::new(epoch()));
        let monitor = test_monitor(dir.path(), clock.clone());

        {
            let mut state = monitor.state.lock().await;
            state.current_track_id = Some("a".into());
            state.current_track_meta = Some(TrackMeta {
                id: "a".into(),
                name: "A".into(),
                artist_id: "ar".into(),
                artist_name: "Artist".into(),
                album_name: "Album".into(),
                album_art: None,
                duration_ms: 200_000,
            });
            state.progress_ms = 60_000; // 30%
            state.duration_ms = 200_000;
            state.in_library = true;
        }

        let outcome = monitor.handle_track_change("b", clock.now()).await;
        assert_eq!(outcome, TrackChangeOutcome::Skipped);
        assert_eq!(monitor.skip_store.get("a").unwrap().skip_count, 1);
    }

    #[tokio::test]
    async fn low_progress_with_long_pause_is_not_a_skip() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(TestClock::new(epoch()));
        let monitor = test_monitor(dir.path(), clock.clone());

        {
            let mut state = monitor.state.lock().await;
            state.current_track_id = Some("a".into());
            state.current_track_meta = Some(TrackMeta {
                id: "a".into(),
                name: "A".into(),
                artist_id: "ar".into(),
                artist_name: "Artist".into(),
                album_name: "Album".into(),
                album_art: None,
                duration_ms: 200_000,
            });
            state.progress_ms = 60_000; // 30%
            state.duration_ms = 200_000;
            state.in_library = true;
            state.total_paused = Duration::from_secs(20);
        }

        let outcome = monitor.handle_track_change("b", clock.now()).await;
        assert_eq!(outcome, TrackChangeOutcome::PausedThenChanged);
        assert!(monitor.skip_store.get("a").is_none());
    }

    #[tokio::test]
    async fn high_progress_is_a_completion() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(TestClock::new(epoch()));
        let monitor = test_monitor(dir.path(), clock.clone());

        {
            let mut state = monitor.state.lock().await;
            state.current_track_id = Some("a".into());
            state.current_track_meta = Some(TrackMeta {
                id: "a".into(),
                name: "A".into(),
                artist_id: "ar".into(),
                artist_name: "Artist".into(),
                album_name: "Album".into(),
                album_art: None,
                duration_ms: 200_000,
            });
            state.progress_ms = 150_000; // 75%
            state.duration_ms = 200_000;
            state.in_library = true;
        }

        let outcome = monitor.handle_track_change("b", clock.now()).await;
        assert_eq!(outcome, TrackChangeOutcome::Completed);
        assert_eq!(monitor.skip_store.get("a").unwrap().not_skipped_count, 1);
    }

    /// End-to-end: once a skip pushes a track's count to the configured threshold, the
    /// monitor issues a real `DELETE /v1/me/tracks` against the upstream (spec §8 scenario 1).
    #[tokio::test]
    async fn skip_at_threshold_triggers_a_library_removal_call() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let saw_delete = Arc::new(AtomicBool::new(false));
        {
            let saw_delete = saw_delete.clone();
            tokio::spawn(async move {
                if let Ok((mut stream, _)) = listener.accept().await {
                    let mut buf = vec![0u8; 4096];
                    if let Ok(n) = stream.read(&mut buf).await {
                        let request = String::from_utf8_lossy(&buf[..n]);
                        saw_delete.store(request.starts_with("DELETE /v1/me/tracks"), Ordering::SeqCst);
                    }
                    let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
                }
            });
        }

        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(TestClock::new(epoch()));
        let monitor = test_monitor_with_api_base(dir.path(), clock.clone(), &format!("http://{addr}/v1")).await;

        // Two prior skips already on record; settings' default skip_threshold is 3.
        monitor.skip_store.update_skipped("a", "A", "Artist", clock.now(), 0.1).unwrap();
        monitor.skip_store.update_skipped("a", "A", "Artist", clock.now(), 0.1).unwrap();
        assert_eq!(monitor.skip_store.get("a").unwrap().skip_count, 2);

        {
            let mut state = monitor.state.lock().await;
            state.current_track_id = Some("a".into());
            state.current_track_meta = Some(TrackMeta {
                id: "a".into(),
                name: "A".into(),
                artist_id: "ar".into(),
                artist_name: "Artist".into(),
                album_name: "Album".into(),
                album_art: None,
                duration_ms: 200_000,
            });
            state.progress_ms = 10_000; // 5%, well under the skip threshold
            state.duration_ms = 200_000;
            state.in_library = true;
        }

        let outcome = monitor.handle_track_change("b", clock.now()).await;
        assert_eq!(outcome, TrackChangeOutcome::Skipped);
        assert_eq!(monitor.skip_store.get("a").unwrap().skip_count, 3);

        // `remove_from_library_with_refresh` is fire-and-forget from the caller's point of
        // view but is awaited inline, so by the time `handle_track_change` returns the
        // upstream call has already landed.
        assert!(saw_delete.load(Ordering::SeqCst), "reaching the skip threshold should remove the track from the library");
    }

    /// Spec §4.6/§7: a repeated auth failure must pause polling and tell the bus exactly
    /// once, not once per failing poll tick.
    #[tokio::test]
    async fn auth_failure_pauses_polling_and_publishes_once() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(TestClock::new(epoch()));
        let monitor = test_monitor(dir.path(), clock.clone());
        let rx = monitor.events.subscribe();

        assert!(!monitor.is_auth_paused());

        monitor.handle_auth_failure();
        monitor.handle_auth_failure();

        assert!(monitor.is_auth_paused());
        let published: Vec<_> = rx.try_iter().collect();
        assert_eq!(published.len(), 1, "should publish AuthStatusChanged exactly once per failure episode");
        assert!(matches!(published[0], Event::AuthStatusChanged(AuthStatus::Unauthenticated)));

        monitor.resume_after_auth();
        assert!(!monitor.is_auth_paused());
    }
}
