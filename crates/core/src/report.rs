use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CopyResult {
    Copied { bytes: u64 },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub result: CopyResult,
}

impl FileOutcome {
    pub fn is_copied(&self) -> bool {
        matches!(self.result, CopyResult::Copied { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    pub snapshot_dir: PathBuf,
    pub started_at: DateTime<Local>,
    pub total: usize,
    pub success: usize,
    pub files: Vec<FileOutcome>,
    /// Older snapshot directories removed by retention after this run.
    pub pruned: Vec<PathBuf>,
}

impl BackupReport {
    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files.iter().filter(|f| !f.is_copied())
    }

    pub fn summary(&self) -> String {
        format!("{}/{} files backed up successfully", self.success, self.total)
    }
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Another run was in progress; nothing was done.
    Busy,
    /// The catalog was empty; no snapshot directory was created.
    Empty,
    Completed(BackupReport),
}
