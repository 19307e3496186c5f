use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use smart_backup_core::{
    BackupReport, CopyResult, EngineState, FileOutcome, NotificationSink, PathCatalog,
    ProgressSink, RunOutcome, Settings,
};
use tracing::{debug, info, warn};

use crate::snapshot::{
    create_snapshot_dir, prune_snapshots, snapshot_dir_name, RunLog, LOG_FILE_NAME,
};

/// Read buffer size for streaming a file into the snapshot.
pub const COPY_CHUNK: usize = 8 * 1024;

/// Copies the catalog into a fresh snapshot directory, one run at a time.
#[derive(Debug)]
pub struct BackupEngine {
    state: Mutex<EngineState>,
}

/// Puts the engine back to `Idle` when a run ends, however it ends.
struct RunningGuard<'a> {
    state: &'a Mutex<EngineState>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *lock(self.state) = EngineState::Idle;
    }
}

fn lock(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for BackupEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Idle),
        }
    }

    pub fn state(&self) -> EngineState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    fn try_begin(&self) -> Option<RunningGuard<'_>> {
        let mut state = lock(&self.state);
        if *state == EngineState::Running {
            return None;
        }
        *state = EngineState::Running;
        Some(RunningGuard { state: &self.state })
    }

    pub fn run(
        &self,
        catalog: &PathCatalog,
        settings: &Settings,
        progress: &dyn ProgressSink,
        notifier: &dyn NotificationSink,
    ) -> RunOutcome {
        self.run_at(catalog, settings, progress, notifier, Local::now())
    }

    /// Runs a backup as if the clock read `now`.
    pub fn run_at(
        &self,
        catalog: &PathCatalog,
        settings: &Settings,
        progress: &dyn ProgressSink,
        notifier: &dyn NotificationSink,
        now: DateTime<Local>,
    ) -> RunOutcome {
        if self.is_running() {
            debug!("backup requested while another run is in progress");
            return RunOutcome::Busy;
        }
        if catalog.is_empty() {
            progress.update("No items to backup", 0.0);
            return RunOutcome::Empty;
        }
        let Some(_guard) = self.try_begin() else {
            return RunOutcome::Busy;
        };

        let entries = catalog.snapshot();
        let total = entries.len();

        let snapshot_dir = match create_snapshot_dir(&settings.destination, &now) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(error = %err, "could not create snapshot directory, every copy will fail");
                settings.destination.join(snapshot_dir_name(&now))
            }
        };
        info!(snapshot = %snapshot_dir.display(), total, "backup started");

        let mut log = RunLog::open(&snapshot_dir, &now);
        // The run log already owns its name inside the snapshot.
        let mut used_names = HashSet::from([OsString::from(LOG_FILE_NAME)]);
        let mut files = Vec::with_capacity(total);
        let mut success = 0;

        for (index, entry) in entries.iter().enumerate() {
            let current = index + 1;
            let source = &entry.path;
            let display_name = source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| source.display().to_string());

            progress.update(
                &format!("Backing up ({current}/{total}): {display_name}"),
                current as f64 / total as f64,
            );

            let Some(base_name) = source.file_name() else {
                warn!(source = %source.display(), "source has no file name, skipping");
                files.push(FileOutcome {
                    source: source.clone(),
                    destination: snapshot_dir.clone(),
                    result: CopyResult::Failed {
                        reason: "source path has no file name".to_owned(),
                    },
                });
                continue;
            };
            let destination = snapshot_dir.join(unique_name(base_name, &mut used_names));

            let result = match copy_file(source, &destination) {
                Ok(bytes) => {
                    success += 1;
                    log.record_copy(source, &destination);
                    debug!(source = %source.display(), bytes, "copied");
                    CopyResult::Copied { bytes }
                }
                Err(err) => {
                    warn!(source = %source.display(), error = %err, "copy failed, skipping");
                    CopyResult::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            files.push(FileOutcome {
                source: source.clone(),
                destination,
                result,
            });
        }

        log.finish(success, total);

        let pruned = if snapshot_dir.is_dir() {
            let keep = usize::try_from(settings.max_copies).unwrap_or(usize::MAX);
            prune_snapshots(&settings.destination, keep, &snapshot_dir).unwrap_or_else(|err| {
                warn!(error = %err, "retention pruning failed");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        if !pruned.is_empty() {
            info!(removed = pruned.len(), max_copies = settings.max_copies, "pruned old snapshots");
        }

        let report = BackupReport {
            snapshot_dir,
            started_at: now,
            total,
            success,
            files,
            pruned,
        };

        let message = format!("Backup completed! {}", report.summary());
        info!(snapshot = %report.snapshot_dir.display(), success, total, "backup finished");
        progress.update(&message, 1.0);
        notify(settings, notifier, "Backup Complete", &message);

        RunOutcome::Completed(report)
    }
}

/// Sends a notification unless the user turned notifications off.
pub fn notify(settings: &Settings, notifier: &dyn NotificationSink, title: &str, message: &str) {
    if settings.show_notifications {
        notifier.notify(title, message);
    }
}

/// Streams `source` into a newly created `destination`. A failure part-way
/// leaves the truncated destination in place.
fn copy_file(source: &Path, destination: &Path) -> io::Result<u64> {
    let mut reader = BufReader::with_capacity(COPY_CHUNK, File::open(source)?);
    let mut writer = File::create(destination)?;
    let bytes = io::copy(&mut reader, &mut writer)?;
    writer.flush()?;
    Ok(bytes)
}

/// Flattened snapshot name for `base`; repeats within a run become `name_2.ext`, `name_3.ext`, ...
fn unique_name(base: &OsStr, used: &mut HashSet<OsString>) -> OsString {
    if used.insert(base.to_os_string()) {
        return base.to_os_string();
    }

    let as_path = Path::new(base);
    let stem = as_path.file_stem().unwrap_or(base).to_string_lossy();
    let ext = as_path.extension().map(|e| e.to_string_lossy());
    for seq in 2u32.. {
        let candidate = match &ext {
            Some(ext) => OsString::from(format!("{stem}_{seq}.{ext}")),
            None => OsString::from(format!("{stem}_{seq}")),
        };
        if used.insert(candidate.clone()) {
            return candidate;
        }
    }
    unreachable!("exhausted snapshot name suffixes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::list_snapshots;
    use chrono::TimeZone;
    use smart_backup_core::NullSink;
    use std::fs;
    use std::path::PathBuf;

    #[derive(Default)]
    struct Recorder {
        progress: Mutex<Vec<(String, f64)>>,
        notices: Mutex<Vec<(String, String)>>,
    }

    impl ProgressSink for Recorder {
        fn update(&self, message: &str, fraction: f64) {
            self.progress
                .lock()
                .unwrap()
                .push((message.to_owned(), fraction));
        }
    }

    impl NotificationSink for Recorder {
        fn notify(&self, title: &str, message: &str) {
            self.notices
                .lock()
                .unwrap()
                .push((title.to_owned(), message.to_owned()));
        }
    }

    fn at(h: u32, mi: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 5, h, mi, 0)
            .single()
            .expect("unambiguous local time")
    }

    fn write(path: &Path, len: usize) -> PathBuf {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'a'; len]).unwrap();
        path.to_path_buf()
    }

    fn settings_for(dest: &Path) -> Settings {
        Settings {
            destination: dest.to_path_buf(),
            ..Settings::default()
        }
    }

    fn completed(outcome: RunOutcome) -> BackupReport {
        match outcome {
            RunOutcome::Completed(report) => report,
            other => panic!("expected a completed run, got {other:?}"),
        }
    }

    #[test]
    fn run_copies_catalog_into_timestamped_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("D");
        let a = write(&tmp.path().join("src/A.txt"), 10);
        let b = write(&tmp.path().join("src/B.txt"), 2048);

        let mut catalog = PathCatalog::new();
        catalog.add(&a);
        catalog.add(&b);

        let engine = BackupEngine::new();
        let sink = Recorder::default();
        let report = completed(engine.run_at(&catalog, &settings_for(&dest), &sink, &sink, at(14, 30)));

        let snapshot = dest.join("Backup_20240305_1430");
        assert_eq!(report.snapshot_dir, snapshot);
        assert_eq!((report.success, report.total), (2, 2));
        assert_eq!(fs::read(snapshot.join("A.txt")).unwrap().len(), 10);
        assert_eq!(fs::read(snapshot.join("B.txt")).unwrap().len(), 2048);

        let mut names: Vec<_> = fs::read_dir(&snapshot)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["A.txt", "B.txt", LOG_FILE_NAME]);

        let log = fs::read_to_string(snapshot.join(LOG_FILE_NAME)).unwrap();
        assert_eq!(log.lines().last(), Some("Backup completed: 2/2 files successful"));
        assert!(log.trim_end().ends_with("2/2 files successful"));

        let progress = sink.progress.lock().unwrap();
        let fractions: Vec<f64> = progress.iter().map(|(_, f)| *f).collect();
        assert_eq!(fractions, vec![0.5, 1.0, 1.0]);
        assert_eq!(progress[0].0, "Backing up (1/2): A.txt");
        assert_eq!(progress[2].0, "Backup completed! 2/2 files backed up successfully");

        let notices = sink.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, "Backup Complete");
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn empty_catalog_creates_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("D");
        let sink = Recorder::default();

        let outcome = BackupEngine::new().run(&PathCatalog::new(), &settings_for(&dest), &sink, &sink);
        assert!(matches!(outcome, RunOutcome::Empty));
        assert!(!dest.exists());
        assert_eq!(
            *sink.progress.lock().unwrap(),
            vec![("No items to backup".to_owned(), 0.0)]
        );
    }

    #[test]
    fn failed_copies_are_counted_but_not_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("D");
        let keep = write(&tmp.path().join("keep.txt"), 3);
        let lost = write(&tmp.path().join("lost.txt"), 3);

        let mut catalog = PathCatalog::new();
        catalog.add(&keep);
        catalog.add(&lost);
        fs::remove_file(&lost).unwrap();

        let report = completed(BackupEngine::new().run_at(
            &catalog,
            &settings_for(&dest),
            &NullSink,
            &NullSink,
            at(9, 0),
        ));
        assert_eq!((report.success, report.total), (1, 2));
        assert_eq!(report.files.len(), 2);
        let failed: Vec<_> = report.failures().map(|f| f.source.clone()).collect();
        assert_eq!(failed, vec![lost]);

        let log = fs::read_to_string(report.snapshot_dir.join(LOG_FILE_NAME)).unwrap();
        let ok_lines = log.lines().filter(|l| l.starts_with("OK ")).count();
        assert_eq!(ok_lines, report.success);
        assert!(!log.contains("lost.txt"));
        assert!(log.trim_end().ends_with("1/2 files successful"));
    }

    struct Reentrant<'a> {
        engine: &'a BackupEngine,
        catalog: &'a PathCatalog,
        settings: &'a Settings,
        nested: Mutex<Vec<RunOutcome>>,
    }

    impl ProgressSink for Reentrant<'_> {
        fn update(&self, _message: &str, _fraction: f64) {
            let mut nested = self.nested.lock().unwrap();
            if nested.is_empty() {
                nested.push(self.engine.run_at(
                    self.catalog,
                    self.settings,
                    &NullSink,
                    &NullSink,
                    at(10, 1),
                ));
            }
        }
    }

    #[test]
    fn trigger_during_a_run_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("D");
        let mut catalog = PathCatalog::new();
        catalog.add(write(&tmp.path().join("x.bin"), 64));
        catalog.add(write(&tmp.path().join("y.bin"), 64));
        let settings = settings_for(&dest);

        let engine = BackupEngine::new();
        let sink = Reentrant {
            engine: &engine,
            catalog: &catalog,
            settings: &settings,
            nested: Mutex::new(Vec::new()),
        };
        let report = completed(engine.run_at(&catalog, &settings, &sink, &NullSink, at(10, 0)));

        assert!(matches!(sink.nested.lock().unwrap()[0], RunOutcome::Busy));
        assert_eq!((report.success, report.total), (2, 2));
        assert_eq!(list_snapshots(&dest).unwrap(), vec![report.snapshot_dir]);
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn runs_in_the_same_minute_get_separate_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("D");
        let mut catalog = PathCatalog::new();
        catalog.add(write(&tmp.path().join("f.txt"), 1));

        let engine = BackupEngine::new();
        let sink = Recorder::default();
        let first = completed(engine.run_at(&catalog, &settings_for(&dest), &sink, &sink, at(14, 30)));
        let second = completed(engine.run_at(&catalog, &settings_for(&dest), &sink, &sink, at(14, 30)));

        assert_eq!(first.snapshot_dir, dest.join("Backup_20240305_1430"));
        assert_eq!(second.snapshot_dir, dest.join("Backup_20240305_1430_2"));
    }

    #[test]
    fn same_base_name_from_different_folders_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("D");
        let mut catalog = PathCatalog::new();
        catalog.add(write(&tmp.path().join("one/notes.txt"), 1));
        catalog.add(write(&tmp.path().join("two/notes.txt"), 2));

        let report = completed(BackupEngine::new().run_at(
            &catalog,
            &settings_for(&dest),
            &NullSink,
            &NullSink,
            at(8, 15),
        ));
        assert_eq!(fs::read(report.snapshot_dir.join("notes.txt")).unwrap().len(), 1);
        assert_eq!(fs::read(report.snapshot_dir.join("notes_2.txt")).unwrap().len(), 2);
    }

    #[test]
    fn source_named_like_the_run_log_does_not_clobber_it() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("D");
        let source = tmp.path().join("src").join(LOG_FILE_NAME);
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, vec![b'Z'; 400]).unwrap();

        let mut catalog = PathCatalog::new();
        catalog.add(&source);
        let report = completed(BackupEngine::new().run_at(
            &catalog,
            &settings_for(&dest),
            &NullSink,
            &NullSink,
            at(11, 45),
        ));

        let copy = report.snapshot_dir.join("backup_log_2.txt");
        assert_eq!(report.files[0].destination, copy);
        assert_eq!(fs::read(&copy).unwrap(), vec![b'Z'; 400]);

        let log = fs::read_to_string(report.snapshot_dir.join(LOG_FILE_NAME)).unwrap();
        assert!(log.starts_with("Backup started: "));
        assert_eq!(log.lines().filter(|l| l.starts_with("OK ")).count(), 1);
        assert_eq!(log.lines().count(), 4);
        assert!(log.trim_end().ends_with("1/1 files successful"));
    }

    #[test]
    fn retention_keeps_max_copies() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("D");
        let mut catalog = PathCatalog::new();
        catalog.add(write(&tmp.path().join("f.txt"), 1));
        let settings = Settings {
            max_copies: 2,
            ..settings_for(&dest)
        };

        let engine = BackupEngine::new();
        let sink = Recorder::default();
        let reports: Vec<_> = (0..3)
            .map(|m| completed(engine.run_at(&catalog, &settings, &sink, &sink, at(12, m))))
            .collect();

        assert_eq!(reports[2].pruned, vec![reports[0].snapshot_dir.clone()]);
        assert_eq!(
            list_snapshots(&dest).unwrap(),
            vec![reports[1].snapshot_dir.clone(), reports[2].snapshot_dir.clone()]
        );
    }

    #[test]
    fn notifications_can_be_switched_off() {
        let tmp = tempfile::tempdir().unwrap();
        let mut catalog = PathCatalog::new();
        catalog.add(write(&tmp.path().join("f.txt"), 1));
        let settings = Settings {
            show_notifications: false,
            ..settings_for(&tmp.path().join("D"))
        };

        let sink = Recorder::default();
        completed(BackupEngine::new().run(&catalog, &settings, &sink, &sink));
        assert!(sink.notices.lock().unwrap().is_empty());
        assert!(!sink.progress.lock().unwrap().is_empty());
    }

    #[test]
    fn unique_name_suffixes_before_extension() {
        let mut used = HashSet::new();
        assert_eq!(unique_name(OsStr::new("a.tar.gz"), &mut used), "a.tar.gz");
        assert_eq!(unique_name(OsStr::new("a.tar.gz"), &mut used), "a.tar_2.gz");
        assert_eq!(unique_name(OsStr::new("README"), &mut used), "README");
        assert_eq!(unique_name(OsStr::new("README"), &mut used), "README_2");
    }
}
