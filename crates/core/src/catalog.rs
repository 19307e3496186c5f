use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

/// One backup source with the display metadata captured when it was added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub path: PathBuf,
    pub size: String,
    pub modified: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Inserted,
    Duplicate,
    /// The path could not be stat'ed; nothing was added.
    Unreadable,
}

/// Ordered, duplicate-free list of backup sources.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathCatalog {
    entries: Vec<CatalogEntry>,
}

impl PathCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, path: impl AsRef<Path>) -> AddOutcome {
        let path = path.as_ref();
        if self.contains(path) {
            return AddOutcome::Duplicate;
        }

        let Ok(meta) = fs::metadata(path) else {
            return AddOutcome::Unreadable;
        };

        self.entries.push(CatalogEntry {
            path: path.to_path_buf(),
            size: format_size(meta.len()),
            modified: meta.modified().map(format_modified).unwrap_or_default(),
        });
        AddOutcome::Inserted
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }

    /// Removes the entry for `path`, returning whether one was present.
    pub fn remove(&mut self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let before = self.entries.len();
        self.entries.retain(|e| e.path != path);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CatalogEntry> {
        self.entries.iter()
    }

    /// Owned copy of the current entries, so a run is unaffected by later inserts.
    pub fn snapshot(&self) -> Vec<CatalogEntry> {
        self.entries.clone()
    }
}

pub fn format_size(bytes: u64) -> String {
    if bytes < KIB {
        format!("{bytes} B")
    } else if bytes < MIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else if bytes < GIB {
        format!("{:.1} MB", bytes as f64 / MIB as f64)
    } else {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    }
}

pub fn format_modified(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format("%Y-%m-%d %H:%M").to_string()
}
