mod engine;
mod enumerate;
pub mod settings_store;
pub mod snapshot;

pub use engine::{notify, BackupEngine, COPY_CHUNK};
pub use enumerate::enumerate;
pub use settings_store::{SettingsStore, DEFAULT_SETTINGS_FILE};
pub use snapshot::{latest_log, list_snapshots, snapshot_dir_name, LOG_FILE_NAME};
