pub mod catalog;
pub mod report;
pub mod settings;
pub mod sink;

pub use catalog::{format_modified, format_size, AddOutcome, CatalogEntry, PathCatalog};
pub use report::{BackupReport, CopyResult, EngineState, FileOutcome, RunOutcome};
pub use settings::{Settings, SettingsError};
pub use sink::{NotificationSink, NullSink, ProgressSink};
