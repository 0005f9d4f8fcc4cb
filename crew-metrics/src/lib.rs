#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Append-only JSONL metrics: one object per line, one directory per UTC
//! day, seven days of retention.
//!
//! Writers serialize through a single process-wide mutex. The store commit
//! path takes the same lock before committing so an external reader only
//! ever sees metric lines for effects that landed.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;

use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub const RETENTION_DAYS: i64 = 7;
pub const FILE_NAME: &str = "api.jsonl";

pub type MetricsResult<T> = Result<T, MetricsError>;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("metrics encode failure: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One event queued by a session for flush at commit time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub kind: String,
    pub payload: serde_json::Value,
}

impl MetricEvent {
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

#[derive(Default)]
struct SinkState {
    day: Option<NaiveDate>,
    file: Option<File>,
}

/// Exclusive hold on the sink tail. Obtained by `MetricsSink::lock`; the
/// store acquires it before `COMMIT` and appends after the commit lands.
pub struct TailGuard<'a> {
    state: MutexGuard<'a, SinkState>,
    dir: &'a Path,
}

impl TailGuard<'_> {
    pub fn append(&mut self, event: &MetricEvent) -> MetricsResult<()> {
        write_event(&mut self.state, self.dir, Utc::now().date_naive(), event)
    }
}

pub struct MetricsSink {
    dir: PathBuf,
    state: Mutex<SinkState>,
}

impl MetricsSink {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Mutex::new(SinkState::default()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Takes the tail-write lock.
    pub fn lock(&self) -> TailGuard<'_> {
        let state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        TailGuard {
            state,
            dir: &self.dir,
        }
    }

    /// Appends one event immediately (non-transactional callers).
    pub fn record(&self, kind: &str, payload: serde_json::Value) -> MetricsResult<()> {
        let mut guard = self.lock();
        guard.append(&MetricEvent::new(kind, payload))
    }

    /// Reads back one day of events. Partial trailing lines (a crash mid
    /// append) are skipped, not fatal.
    pub fn read_day(&self, day: NaiveDate) -> MetricsResult<Vec<serde_json::Value>> {
        let path = self.dir.join(day.format("%Y-%m-%d").to_string()).join(FILE_NAME);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(source) => return Err(MetricsError::Io { path, source }),
        };
        let mut events = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => events.push(value),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unparsable metric line");
                }
            }
        }
        Ok(events)
    }
}

fn write_event(
    state: &mut SinkState,
    dir: &Path,
    day: NaiveDate,
    event: &MetricEvent,
) -> MetricsResult<()> {
    if state.day != Some(day) || state.file.is_none() {
        rotate(state, dir, day)?;
    }
    let line = serde_json::to_string(&serde_json::json!({
        "ts": Utc::now().to_rfc3339(),
        "kind": event.kind,
        "payload": event.payload,
    }))?;
    if let Some(file) = state.file.as_mut() {
        writeln!(file, "{line}").map_err(|source| MetricsError::Io {
            path: dir.join(day.format("%Y-%m-%d").to_string()).join(FILE_NAME),
            source,
        })?;
        file.flush().map_err(|source| MetricsError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

fn rotate(state: &mut SinkState, dir: &Path, day: NaiveDate) -> MetricsResult<()> {
    let day_dir = dir.join(day.format("%Y-%m-%d").to_string());
    fs::create_dir_all(&day_dir).map_err(|source| MetricsError::Io {
        path: day_dir.clone(),
        source,
    })?;
    let path = day_dir.join(FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| MetricsError::Io { path, source })?;
    state.file = Some(file);
    state.day = Some(day);
    purge_expired(dir, day);
    Ok(())
}

/// Removes day directories past the retention window. Failures are logged
/// and never fail the write that triggered rotation.
fn purge_expired(dir: &Path, today: NaiveDate) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "metrics purge skipped");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Ok(day) = NaiveDate::parse_from_str(name, "%Y-%m-%d") else {
            continue;
        };
        if (today - day).num_days() > RETENTION_DAYS
            && let Err(err) = fs::remove_dir_all(entry.path())
        {
            warn!(path = %entry.path().display(), error = %err, "failed to purge metrics day");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_on(sink: &MetricsSink, day: NaiveDate, kind: &str) {
        let mut guard = sink.lock();
        write_event(
            &mut guard.state,
            guard.dir,
            day,
            &MetricEvent::new(kind, json!({"n": 1})),
        )
        .expect("write event");
    }

    #[test]
    fn appends_one_json_object_per_line() {
        let dir = TempDir::new().expect("temp dir");
        let sink = MetricsSink::new(dir.path());
        sink.record("shift.start", json!({"user_id": 7}))
            .expect("record");
        sink.record("shift.end", json!({"user_id": 7}))
            .expect("record");

        let today = Utc::now().date_naive();
        let events = sink.read_day(today).expect("read day");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["kind"], "shift.start");
        assert_eq!(events[0]["payload"]["user_id"], 7);
        assert_eq!(events[1]["kind"], "shift.end");
    }

    #[test]
    fn rotates_by_utc_day() {
        let dir = TempDir::new().expect("temp dir");
        let sink = MetricsSink::new(dir.path());
        let today = Utc::now().date_naive();
        let yesterday = today - Duration::days(1);

        write_on(&sink, yesterday, "task.add");
        write_on(&sink, today, "task.add");

        assert!(dir
            .path()
            .join(yesterday.format("%Y-%m-%d").to_string())
            .join(FILE_NAME)
            .exists());
        assert!(dir
            .path()
            .join(today.format("%Y-%m-%d").to_string())
            .join(FILE_NAME)
            .exists());
    }

    #[test]
    fn purges_directories_older_than_retention() {
        let dir = TempDir::new().expect("temp dir");
        let sink = MetricsSink::new(dir.path());
        let today = Utc::now().date_naive();
        let stale = today - Duration::days(RETENTION_DAYS + 2);
        let stale_dir = dir.path().join(stale.format("%Y-%m-%d").to_string());
        fs::create_dir_all(&stale_dir).expect("stale dir");
        fs::write(stale_dir.join(FILE_NAME), "{}\n").expect("stale file");

        write_on(&sink, today, "mod.approve");

        assert!(!stale_dir.exists());
    }

    #[test]
    fn tolerates_partial_trailing_line() {
        let dir = TempDir::new().expect("temp dir");
        let sink = MetricsSink::new(dir.path());
        let today = Utc::now().date_naive();
        sink.record("expense.add", json!({"id": 1})).expect("record");

        let path = dir
            .path()
            .join(today.format("%Y-%m-%d").to_string())
            .join(FILE_NAME);
        let mut file = OpenOptions::new().append(true).open(&path).expect("open");
        file.write_all(b"{\"kind\":\"trunc").expect("partial write");

        let events = sink.read_day(today).expect("read day");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["kind"], "expense.add");
    }

    #[test]
    fn tail_guard_serializes_queued_appends() {
        let dir = TempDir::new().expect("temp dir");
        let sink = MetricsSink::new(dir.path());
        {
            let mut guard = sink.lock();
            guard
                .append(&MetricEvent::new("mod.approve", json!({"id": 3})))
                .expect("append");
            guard
                .append(&MetricEvent::new("mod.reject", json!({"id": 4})))
                .expect("append");
        }
        let events = sink.read_day(Utc::now().date_naive()).expect("read day");
        assert_eq!(events.len(), 2);
    }
}
