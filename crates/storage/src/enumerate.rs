use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use smart_backup_core::{AddOutcome, PathCatalog, Settings};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Adds the files under `root` to the catalog and returns how many were new.
///
/// A regular file root is added unless it is hidden. For a directory, immediate
/// children are added and subdirectories are descended into only when
/// `recursive` is set. Names starting with `.` are skipped unless
/// `settings.include_hidden`; a directory root is walked even when hidden.
/// Unreadable paths and symlink loops are skipped without error.
pub fn enumerate(
    catalog: &mut PathCatalog,
    root: &Path,
    recursive: bool,
    settings: &Settings,
) -> usize {
    let meta = match fs::metadata(root) {
        Ok(meta) => meta,
        Err(err) => {
            debug!(root = %root.display(), error = %err, "skipping unreadable root");
            return 0;
        }
    };

    if meta.is_file() {
        if !settings.include_hidden && root.file_name().is_some_and(is_hidden_name) {
            debug!(root = %root.display(), "skipping hidden file");
            return 0;
        }
        return usize::from(catalog.add(root) == AddOutcome::Inserted);
    }
    if !meta.is_dir() {
        return 0;
    }

    let walker = WalkDir::new(root)
        .follow_links(true)
        .min_depth(1)
        .max_depth(if recursive { usize::MAX } else { 1 })
        .sort_by_file_name();

    let include_hidden = settings.include_hidden;
    let mut inserted = 0;
    for entry in walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || include_hidden || !is_hidden(e))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "skipping entry during enumeration");
                continue;
            }
        };
        if entry.file_type().is_file() && catalog.add(entry.path()) == AddOutcome::Inserted {
            inserted += 1;
        }
    }

    debug!(root = %root.display(), recursive, inserted, "enumerated directory");
    inserted
}

fn is_hidden(entry: &DirEntry) -> bool {
    is_hidden_name(entry.file_name())
}

fn is_hidden_name(name: &OsStr) -> bool {
    name.as_encoded_bytes().starts_with(b".")
}
