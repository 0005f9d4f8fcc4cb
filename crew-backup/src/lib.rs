#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Hot backup and verified restore for the store's database file.
//!
//! A backup is an online `VACUUM INTO` copy plus one manifest line pinning
//! its SHA-256. Restore refuses to touch the live database unless the
//! target file's hash matches its manifest entry; the copy-back runs
//! through SQLite's backup API so readers never see a torn file.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use rusqlite::Connection;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use tracing::warn;

use crew_money::sha256_hex;
use crew_store::Store;

pub const MANIFEST_FILE: &str = "manifest.jsonl";

pub type BackupResult<T> = Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{file} has no manifest entry")]
    NotInManifest { file: String },
    #[error("checksum mismatch for {file}: manifest {expected}, actual {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("database failure: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Store(#[from] crew_store::StoreError),
    #[error("manifest encode failure: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupStatus {
    pub last_backup_at: Option<DateTime<Utc>>,
    pub backup_count: u64,
    pub latest_file: Option<String>,
}

/// Copies the live database into `backups_dir` and appends the manifest
/// line. The copy is consistent even with concurrent writers.
pub fn create(store: &Store, backups_dir: &Path) -> BackupResult<ManifestEntry> {
    fs::create_dir_all(backups_dir).map_err(|source| BackupError::Io {
        path: backups_dir.to_path_buf(),
        source,
    })?;

    let file = format!("backup_{}.db", Utc::now().format("%Y%m%d_%H%M%S"));
    let target = backups_dir.join(&file);
    let target_str = target.to_string_lossy().to_string();

    let conn = store.raw_conn()?;
    conn.execute("VACUUM INTO ?1", [&target_str])?;

    let bytes = fs::read(&target).map_err(|source| BackupError::Io {
        path: target.clone(),
        source,
    })?;
    let entry = ManifestEntry {
        file,
        size_bytes: bytes.len() as u64,
        sha256: sha256_hex(&bytes),
        created_at: Utc::now(),
    };

    let manifest_path = backups_dir.join(MANIFEST_FILE);
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');
    append_to_file(&manifest_path, line.as_bytes())?;
    info!(file = %entry.file, sha256 = %entry.sha256, "backup created");
    Ok(entry)
}

/// Restores `file` over the live database after verifying its SHA-256
/// against the manifest. A failed verification leaves everything as it
/// was.
pub fn restore(store: &Store, backups_dir: &Path, file: &str) -> BackupResult<()> {
    let entry = manifest_entries(backups_dir)?
        .into_iter()
        .rev()
        .find(|entry| entry.file == file)
        .ok_or_else(|| BackupError::NotInManifest { file: file.into() })?;

    let source_path = backups_dir.join(file);
    let bytes = fs::read(&source_path).map_err(|source| BackupError::Io {
        path: source_path.clone(),
        source,
    })?;
    let actual = sha256_hex(&bytes);
    if actual != entry.sha256 {
        return Err(BackupError::ChecksumMismatch {
            file: file.into(),
            expected: entry.sha256,
            actual,
        });
    }

    let source = Connection::open_with_flags(
        &source_path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )?;
    let mut live = store.raw_conn()?;
    let backup = rusqlite::backup::Backup::new(&source, &mut live)?;
    backup.run_to_completion(64, std::time::Duration::from_millis(20), None)?;
    info!(file, "backup restored over live database");
    Ok(())
}

/// Manifest summary for the settings endpoint.
pub fn status(backups_dir: &Path) -> BackupResult<BackupStatus> {
    let entries = manifest_entries(backups_dir)?;
    let latest = entries.last().cloned();
    Ok(BackupStatus {
        backup_count: entries.len() as u64,
        last_backup_at: latest.as_ref().map(|entry| entry.created_at),
        latest_file: latest.map(|entry| entry.file),
    })
}

fn manifest_entries(backups_dir: &Path) -> BackupResult<Vec<ManifestEntry>> {
    let path = backups_dir.join(MANIFEST_FILE);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(BackupError::Io { path, source }),
    };
    let mut entries = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                warn!(error = %err, "skipping unparsable manifest line");
            }
        }
    }
    Ok(entries)
}

fn append_to_file(path: &Path, bytes: &[u8]) -> BackupResult<()> {
    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| BackupError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.write_all(bytes).map_err(|source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn store_with_row(dir: &TempDir) -> Store {
        let store = Store::open(dir.path().join("crew.db")).expect("open store");
        store.migrate().expect("migrate");
        let conn = store.raw_conn().expect("conn");
        conn.execute(
            "INSERT INTO clients (name, created_at) VALUES ('acme', ?1)",
            [crew_store::now_rfc3339()],
        )
        .expect("insert client");
        store
    }

    #[test]
    fn create_writes_copy_and_manifest_line() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_with_row(&dir);
        let backups = dir.path().join("backups");

        let entry = create(&store, &backups).expect("backup");
        assert!(entry.file.starts_with("backup_"));
        assert!(entry.file.ends_with(".db"));
        assert!(entry.size_bytes > 0);
        assert_eq!(entry.sha256.len(), 64);
        assert!(backups.join(&entry.file).exists());

        let summary = status(&backups).expect("status");
        assert_eq!(summary.backup_count, 1);
        assert_eq!(summary.latest_file, Some(entry.file));
    }

    #[test]
    fn restore_round_trips_data() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_with_row(&dir);
        let backups = dir.path().join("backups");
        let entry = create(&store, &backups).expect("backup");

        // Mutate after the backup, then restore the snapshot.
        let conn = store.raw_conn().expect("conn");
        conn.execute(
            "INSERT INTO clients (name, created_at) VALUES ('late-client', ?1)",
            [crew_store::now_rfc3339()],
        )
        .expect("insert");
        drop(conn);

        restore(&store, &backups, &entry.file).expect("restore");

        let conn = store.raw_conn().expect("conn");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn tampered_backup_is_refused() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_with_row(&dir);
        let backups = dir.path().join("backups");
        let entry = create(&store, &backups).expect("backup");

        let path = backups.join(&entry.file);
        let mut bytes = fs::read(&path).expect("read backup");
        let len = bytes.len();
        bytes[len - 1] ^= 0xFF;
        fs::write(&path, bytes).expect("tamper");

        let err = restore(&store, &backups, &entry.file).expect_err("refused");
        assert!(matches!(err, BackupError::ChecksumMismatch { .. }));

        // The live database is untouched.
        let conn = store.raw_conn().expect("conn");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM clients", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn unknown_file_is_not_in_manifest() {
        let dir = TempDir::new().expect("temp dir");
        let store = store_with_row(&dir);
        let backups = dir.path().join("backups");
        create(&store, &backups).expect("backup");

        let err = restore(&store, &backups, "backup_19990101_000000.db")
            .expect_err("unknown file");
        assert!(matches!(err, BackupError::NotInManifest { .. }));
    }
}
