use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use smart_backup_core::Settings;
use tracing::{info, warn};

pub const DEFAULT_SETTINGS_FILE: &str = "backup_config.txt";

/// Reads and writes the `key=value` settings file.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the settings, falling back to (and persisting) the defaults when
    /// the file is missing or unreadable.
    pub fn load(&self) -> Settings {
        match fs::read_to_string(&self.path) {
            Ok(raw) => {
                let parsed = Settings::parse(&raw);
                for rejected in &parsed.rejected {
                    warn!(
                        path = %self.path.display(),
                        key = %rejected.key,
                        value = %rejected.value,
                        "ignoring unparseable setting"
                    );
                }
                parsed.settings
            }
            Err(err) => {
                if err.kind() == ErrorKind::NotFound {
                    info!(path = %self.path.display(), "settings file missing, writing defaults");
                } else {
                    warn!(path = %self.path.display(), error = %err, "settings file unreadable, using defaults");
                }
                let defaults = Settings::default();
                if let Err(err) = self.save(&defaults) {
                    warn!(error = %err, "could not persist default settings");
                }
                defaults
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create settings directory: {}", parent.display()))?;
        }
        fs::write(&self.path, settings.to_config_string())
            .with_context(|| format!("write settings file: {}", self.path.display()))?;
        Ok(())
    }
}
