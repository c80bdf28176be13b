use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use platform_dirs::AppDirs;
use serde::{Deserialize, Serialize};

/// Spotify Web API client id used for the OAuth2 authorization-code flow. Unlike a client
/// secret, this value is considered public for native/desktop apps and is safe to bake in.
pub const CLIENT_ID: &str = "d420a117a32841c2b3474932e49fb54b";

const APP_NAME: &str = "spotify-skip-tracker";

/// A `--basepath` override forces config/cache/data to live under one directory instead of
/// the platform defaults; set once at startup from the CLI.
static BASE_PATH: OnceLock<Option<PathBuf>> = OnceLock::new();

pub fn set_base_path(path: Option<PathBuf>) {
    let _ = BASE_PATH.set(path);
}

fn app_dirs() -> AppDirs {
    AppDirs::new(Some(APP_NAME), true).expect("could not determine platform directories")
}

pub fn config_dir() -> PathBuf {
    match BASE_PATH.get().and_then(|p| p.clone()) {
        Some(base) => base.join("config"),
        None => app_dirs().config_dir,
    }
}

pub fn data_dir() -> PathBuf {
    match BASE_PATH.get().and_then(|p| p.clone()) {
        Some(base) => base.join("data"),
        None => app_dirs().data_dir,
    }
}

pub fn cache_dir() -> PathBuf {
    match BASE_PATH.get().and_then(|p| p.clone()) {
        Some(base) => base.join("cache"),
        None => app_dirs().cache_dir,
    }
}

/// Path to a named file inside the data directory (tokens, skip records, statistics, logs).
pub fn data_path(name: impl AsRef<Path>) -> PathBuf {
    data_dir().join(name)
}

pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Level for the rotating log files and the in-memory log ring (C9), and the threshold for
/// what `GetLogs` surfaces to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Debug => log::LevelFilter::Debug,
            Self::Info => log::LevelFilter::Info,
            Self::Warning => log::LevelFilter::Warn,
            Self::Error => log::LevelFilter::Error,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

/// The bus-mutable subset of configuration (`GetSettings`/`SaveSettings`), persisted
/// separately from the static startup [`Config`] so that saving settings from the bus never
/// needs to touch CLI-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Percent (0-100) of a track's duration below which a track change counts as a skip.
    pub skip_progress: u8,
    /// Skip count above which an in-library track is automatically removed.
    pub skip_threshold: u32,
    /// Window, in days, statistics queries default to when no explicit range is given.
    pub timeframe_in_days: u32,
    pub log_level: LogLevel,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            skip_progress: 70,
            skip_threshold: 3,
            timeframe_in_days: 30,
            log_level: LogLevel::default(),
        }
    }
}

impl Settings {
    /// `skipProgress` as a 0.0-1.0 fraction, the unit `HandleTrackChange` actually compares
    /// against the played fraction.
    pub fn skip_progress_fraction(&self) -> f64 {
        f64::from(self.skip_progress) / 100.0
    }

    pub fn load(path: &Path) -> Self {
        crate::persist::read_json_opt(path)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> crate::error::Result<()> {
        crate::persist::write_json_atomic(path, self)
    }
}

/// Static, process-startup configuration: the HTTP retry policy and anything else read once
/// from `settings.toml` plus CLI overrides. Distinct from [`Settings`] (see module docs).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum attempts for a single logical HTTP call before giving up (default 3).
    pub max_retries: u32,
    /// Initial backoff delay in milliseconds before jitter (default 1000).
    pub initial_backoff_ms: u64,
    /// Per-request timeout in milliseconds (10s total timeout).
    pub request_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1000,
            request_timeout_ms: 10_000,
        }
    }
}

impl Config {
    /// Load `filename` from the configuration directory, falling back to defaults if absent
    /// or malformed (a daemon should still start with sane defaults rather than refuse to
    /// run because of a missing config file).
    pub fn load(filename: &str) -> Self {
        let path = config_dir().join(filename);
        match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("could not parse {}: {e}, using defaults", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}
