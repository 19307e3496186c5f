use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::warn;

pub const SNAPSHOT_PREFIX: &str = "Backup_";
pub const LOG_FILE_NAME: &str = "backup_log.txt";

/// `Backup_YYYYMMDD_HHMM` for the given local time.
pub fn snapshot_dir_name(now: &DateTime<Local>) -> String {
    now.format("Backup_%Y%m%d_%H%M").to_string()
}

/// Creates the snapshot directory for a run, appending `_2`, `_3`, ... when a
/// run in the same minute already claimed the plain name.
pub fn create_snapshot_dir(destination: &Path, now: &DateTime<Local>) -> Result<PathBuf> {
    fs::create_dir_all(destination)
        .with_context(|| format!("create backup destination: {}", destination.display()))?;

    let base = snapshot_dir_name(now);
    let mut candidate = destination.join(&base);
    let mut seq = 1u32;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                seq += 1;
                candidate = destination.join(format!("{base}_{seq}"));
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("create snapshot dir: {}", candidate.display()))
            }
        }
    }
}

/// Sort key of a snapshot directory name: `(YYYYMMDD_HHMM, sequence)`.
fn snapshot_key(name: &str) -> Option<(&str, u32)> {
    let rest = name.strip_prefix(SNAPSHOT_PREFIX)?;
    let stamp = rest.get(..13)?;
    let well_formed = stamp.char_indices().all(|(i, c)| {
        if i == 8 {
            c == '_'
        } else {
            c.is_ascii_digit()
        }
    });
    if !well_formed {
        return None;
    }
    match &rest[13..] {
        "" => Some((stamp, 1)),
        suffix => suffix
            .strip_prefix('_')
            .and_then(|n| n.parse().ok())
            .map(|seq| (stamp, seq)),
    }
}

/// Snapshot directories under `destination`, oldest first.
pub fn list_snapshots(destination: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let entries = fs::read_dir(destination)
        .with_context(|| format!("read backup destination: {}", destination.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some((stamp, seq)) = snapshot_key(name) {
            found.push((stamp.to_owned(), seq, entry.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, _, path)| path).collect())
}

/// Deletes the oldest snapshots so that at most `keep` remain. `current` is never deleted.
pub fn prune_snapshots(destination: &Path, keep: usize, current: &Path) -> Result<Vec<PathBuf>> {
    let snapshots = list_snapshots(destination)?;
    let excess = snapshots.len().saturating_sub(keep.max(1));

    let mut removed = Vec::new();
    for dir in snapshots.into_iter().filter(|d| d != current).take(excess) {
        fs::remove_dir_all(&dir)
            .with_context(|| format!("remove old snapshot: {}", dir.display()))?;
        removed.push(dir);
    }
    Ok(removed)
}

/// Path and contents of the most recently written run log, if any.
pub fn latest_log(destination: &Path) -> Result<Option<(PathBuf, String)>> {
    if !destination.is_dir() {
        return Ok(None);
    }

    let mut latest: Option<(SystemTime, PathBuf)> = None;
    for dir in list_snapshots(destination)? {
        let log_path = dir.join(LOG_FILE_NAME);
        let Ok(modified) = fs::metadata(&log_path).and_then(|m| m.modified()) else {
            continue;
        };
        if latest.as_ref().map_or(true, |(t, _)| modified >= *t) {
            latest = Some((modified, log_path));
        }
    }

    match latest {
        Some((_, path)) => {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read run log: {}", path.display()))?;
            Ok(Some((path, contents)))
        }
        None => Ok(None),
    }
}

/// Per-run transfer log. A log that cannot be opened or written is dropped
/// with a warning; the run carries on without it.
pub struct RunLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl RunLog {
    pub fn open(snapshot_dir: &Path, started_at: &DateTime<Local>) -> Self {
        let path = snapshot_dir.join(LOG_FILE_NAME);
        let writer = match File::create(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not open run log");
                None
            }
        };
        let mut log = Self { path, writer };
        log.line(format_args!(
            "Backup started: {}",
            started_at.format("%a %b %e %H:%M:%S %Y")
        ));
        log
    }

    pub fn record_copy(&mut self, source: &Path, destination: &Path) {
        self.line(format_args!(
            "OK {} -> {}",
            source.display(),
            destination.display()
        ));
    }

    pub fn finish(mut self, success: usize, total: usize) {
        self.line(format_args!(
            "\nBackup completed: {success}/{total} files successful"
        ));
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.flush() {
                warn!(path = %self.path.display(), error = %err, "could not flush run log");
            }
        }
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(err) = writeln!(writer, "{args}") {
            warn!(path = %self.path.display(), error = %err, "run log write failed, closing log");
            self.writer = None;
        }
    }
}
