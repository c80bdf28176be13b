//! Rotating, level-filtered log storage surfaced to the shell (C9).
//!
//! Grounded on the teacher's `application.rs::setup_logging` (`fern::Dispatch` + `chrono`
//! timestamp format, per-module level overrides), extended with two custom `log::Log` sinks
//! chained alongside the usual stderr/file output: one that mirrors every record into a
//! bounded in-memory ring (so `Get(n)` never touches disk) and one that rotates the on-disk
//! file at the wall-clock date boundary (the teacher's `fern::log_file` binds one fixed
//! path; this daemon wants a new file per day).

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use log::{Level, Log, Metadata, Record};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::LogLevel;
use crate::error::{Error, Result};

const RING_CAPACITY: usize = 500;

/// One log line, structured for `Get`/`GetFromFile`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

fn parse_level(level: Level) -> LogLevel {
    match level {
        Level::Error => LogLevel::Error,
        Level::Warn => LogLevel::Warning,
        Level::Info => LogLevel::Info,
        Level::Debug | Level::Trace => LogLevel::Debug,
    }
}

/// `log::Log` sink that mirrors every accepted record into a bounded ring buffer.
struct RingSink {
    ring: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
    level: log::LevelFilter,
}

impl Log for RingSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(LogEntry {
            ts: self.clock.now(),
            level: parse_level(record.level()),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {}
}

/// `log::Log` sink that appends formatted lines to `data/logs/<date>.log`, reopening a new
/// file whenever the injected clock's date advances past the currently open one.
struct RotatingFileSink {
    logs_dir: PathBuf,
    clock: Arc<dyn Clock>,
    level: log::LevelFilter,
    open: Mutex<Option<(NaiveDate, std::fs::File)>>,
}

impl RotatingFileSink {
    fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.logs_dir.join(format!("{}.log", date.format("%Y-%m-%d")))
    }

    fn with_open_file<R>(&self, f: impl FnOnce(&mut std::fs::File) -> std::io::Result<R>) -> std::io::Result<R> {
        let today = self.clock.now().date_naive();
        let mut guard = self.open.lock();

        let needs_new = match guard.as_ref() {
            Some((date, _)) => *date != today,
            None => true,
        };
        if needs_new {
            std::fs::create_dir_all(&self.logs_dir)?;
            let file = OpenOptions::new().create(true).append(true).open(self.path_for(today))?;
            *guard = Some((today, file));
        }

        let (_, file) = guard.as_mut().expect("just opened above");
        f(file)
    }
}

impl Log for RotatingFileSink {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} [{}] [{}] {}\n",
            self.clock.now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            record.target(),
            record.level(),
            record.args(),
        );
        let _ = self.with_open_file(|file| file.write_all(line.as_bytes()));
    }

    fn flush(&self) {
        let mut guard = self.open.lock();
        if let Some((_, file)) = guard.as_mut() {
            let _ = file.flush();
        }
    }
}

/// Fans a single log record out to every configured sink. Built from one `fern::Dispatch`
/// (stderr, timestamp-formatted, matching the teacher's `setup_logging`) converted with
/// `Dispatch::into_log()` — the documented way to embed a fern pipeline inside a hand-rolled
/// `log::Log`, used here because the ring/rotation sinks below are not things fern itself
/// knows how to be (a bounded in-memory buffer, a date-keyed file that reopens itself).
struct CombinedLog {
    max_level: log::LevelFilter,
    stderr: Box<dyn Log>,
    rotating: RotatingFileSink,
    ring: RingSink,
    debug_file: Option<Box<dyn Log>>,
}

impl Log for CombinedLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.stderr.log(record);
        self.rotating.log(record);
        self.ring.log(record);
        if let Some(debug_file) = &self.debug_file {
            debug_file.log(record);
        }
    }

    fn flush(&self) {
        self.stderr.flush();
        self.rotating.flush();
        self.ring.flush();
        if let Some(debug_file) = &self.debug_file {
            debug_file.flush();
        }
    }
}

/// The log store (C9): owns the in-memory ring behind `Get(n)`, and reads historical
/// daily-rotated files from disk for `GetFromFile`/`ListFiles`. The actual writing happens
/// implicitly through the `log` macros once [`LogStore::init`] installs the global logger;
/// there is no separate write path callers invoke directly.
pub struct LogStore {
    ring: Arc<Mutex<VecDeque<LogEntry>>>,
    logs_dir: PathBuf,
}

impl LogStore {
    /// Install the global logger (stderr + rotating file + ring) and return the handle used
    /// to query it. Must be called exactly once, as early as possible in `main`.
    pub fn init(
        logs_dir: PathBuf,
        level: LogLevel,
        debug_file: Option<&Path>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        let ring = Arc::new(Mutex::new(VecDeque::with_capacity(RING_CAPACITY)));
        std::fs::create_dir_all(&logs_dir)?;

        let level_filter = level.to_level_filter();
        let format = |out: fern::FormatCallback, message: &std::fmt::Arguments, record: &Record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        };

        let (_, stderr_log) = fern::Dispatch::new()
            .format(format)
            .level(level_filter)
            .chain(std::io::stderr())
            .into_log();

        let mut max_level = level_filter;

        let debug_log = match debug_file {
            Some(path) => {
                max_level = log::LevelFilter::Debug.max(max_level);
                let (_, log) = fern::Dispatch::new()
                    .format(format)
                    .level(log::LevelFilter::Debug)
                    .chain(fern::log_file(path).map_err(|e| Error::Persist(e.to_string()))?)
                    .into_log();
                Some(log)
            }
            None => None,
        };

        let combined = CombinedLog {
            max_level,
            stderr: stderr_log,
            rotating: RotatingFileSink {
                logs_dir: logs_dir.clone(),
                clock: clock.clone(),
                level: level_filter,
                open: Mutex::new(None),
            },
            ring: RingSink {
                ring: ring.clone(),
                capacity: RING_CAPACITY,
                clock: clock.clone(),
                level: level_filter,
            },
            debug_file: debug_log,
        };

        log::set_max_level(max_level);
        log::set_boxed_logger(Box::new(combined)).map_err(|e| Error::Persist(e.to_string()))?;

        Ok(Arc::new(Self { ring, logs_dir }))
    }

    /// The most recent `n` entries observed by the in-memory ring, oldest first.
    pub fn get(&self, n: usize) -> Vec<LogEntry> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    /// Read up to `n` entries back out of a named historical log file (`YYYY-MM-DD.log`).
    pub fn get_from_file(&self, name: &str, n: usize) -> Result<Vec<LogEntry>> {
        let path = self.logs_dir.join(name);
        let contents = std::fs::read_to_string(&path)?;
        let entries: Vec<LogEntry> = contents.lines().filter_map(parse_log_line).collect();
        let skip = entries.len().saturating_sub(n);
        Ok(entries.into_iter().skip(skip).collect())
    }

    /// Filenames of every daily-rotated log file on disk, oldest first.
    pub fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&self.logs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".log") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Clear the in-memory ring. Historical files are left on disk: there is no automatic
    /// retention/pruning policy, `ListFiles`/manual deletion is the operator path.
    pub fn clear(&self) {
        self.ring.lock().clear();
    }
}

fn parse_log_line(line: &str) -> Option<LogEntry> {
    // Lines look like: "2024-01-01T00:00:00.000Z [target] [LEVEL] message"
    let (ts_part, rest) = line.split_once(' ')?;
    let ts = DateTime::parse_from_rfc3339(ts_part).ok()?.with_timezone(&Utc);

    let level_start = rest.find('[')?;
    let level_rest = &rest[level_start..];
    let (_, level_rest) = level_rest.split_once("] [")?;
    let (level_str, message) = level_rest.split_once(']')?;

    let level = match level_str {
        "ERROR" => LogLevel::Error,
        "WARN" => LogLevel::Warning,
        "INFO" => LogLevel::Info,
        _ => LogLevel::Debug,
    };

    Some(LogEntry {
        ts,
        level,
        message: message.trim_start().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_well_formed_log_line() {
        let line = "2024-01-01T00:00:00.000Z [spotify_skip_tracker::monitor] [INFO] now playing X";
        let entry = parse_log_line(line).unwrap();
        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.message, "now playing X");
    }

    #[test]
    fn malformed_line_is_skipped_not_panicking() {
        assert!(parse_log_line("not a log line").is_none());
    }

    #[test]
    fn ring_get_returns_most_recent_n_oldest_first() {
        let ring = Arc::new(Mutex::new(VecDeque::new()));
        for i in 0..5 {
            ring.lock().push_back(LogEntry {
                ts: DateTime::UNIX_EPOCH,
                level: LogLevel::Info,
                message: format!("line {i}"),
            });
        }
        let store = LogStore {
            ring,
            logs_dir: PathBuf::from("/tmp/does-not-matter"),
        };
        let recent = store.get(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "line 3");
        assert_eq!(recent[1].message, "line 4");
    }

    #[test]
    fn list_files_on_missing_directory_is_empty_not_error() {
        let store = LogStore {
            ring: Arc::new(Mutex::new(VecDeque::new())),
            logs_dir: PathBuf::from("/tmp/spotify-skip-tracker-nonexistent-dir-xyz"),
        };
        assert_eq!(store.list_files().unwrap(), Vec::<String>::new());
    }
}
