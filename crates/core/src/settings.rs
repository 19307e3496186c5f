use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_INTERVAL_SECS: u64 = 60;
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Process-wide backup settings, persisted as a `key=value` text file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub destination: PathBuf,
    pub auto_backup: bool,
    pub interval_secs: u64,
    pub max_copies: u32,
    pub include_subfolders: bool,
    pub include_hidden: bool,
    pub show_notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            destination: PathBuf::from("./backups"),
            auto_backup: true,
            interval_secs: 300,
            max_copies: 10,
            include_subfolders: true,
            include_hidden: false,
            show_notifications: true,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("backup destination must not be empty")]
    EmptyDestination,
    #[error("backup interval {0}s is outside 60..=86400 seconds")]
    IntervalOutOfRange(u64),
    #[error("max_copies must be at least 1")]
    ZeroMaxCopies,
}

/// A recognised key whose value could not be parsed; the previous value was kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ParsedSettings {
    pub settings: Settings,
    pub rejected: Vec<RejectedValue>,
}

impl Settings {
    /// Parses the settings file format on top of the defaults.
    ///
    /// Lines without `=`, lines with an empty value and unknown keys are ignored.
    pub fn parse(raw: &str) -> ParsedSettings {
        let mut settings = Settings::default();
        let mut rejected = Vec::new();

        for line in raw.lines() {
            let line = line.trim_end_matches('\r');
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.is_empty() || value.is_empty() {
                continue;
            }

            let accepted = match key {
                "destination" => {
                    settings.destination = PathBuf::from(value);
                    true
                }
                "auto_backup" => parse_flag(value).map(|v| settings.auto_backup = v).is_some(),
                "interval" => value.trim().parse().map(|v| settings.interval_secs = v).is_ok(),
                "max_copies" => value.trim().parse().map(|v| settings.max_copies = v).is_ok(),
                "subfolders" => parse_flag(value)
                    .map(|v| settings.include_subfolders = v)
                    .is_some(),
                "hidden" => parse_flag(value).map(|v| settings.include_hidden = v).is_some(),
                "notifications" => parse_flag(value)
                    .map(|v| settings.show_notifications = v)
                    .is_some(),
                _ => true,
            };

            if !accepted {
                rejected.push(RejectedValue {
                    key: key.to_owned(),
                    value: value.to_owned(),
                });
            }
        }

        ParsedSettings { settings, rejected }
    }

    /// Renders every key, one per line, in the order the file is read back.
    pub fn to_config_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "destination={}", self.destination.display());
        let _ = writeln!(out, "auto_backup={}", u8::from(self.auto_backup));
        let _ = writeln!(out, "interval={}", self.interval_secs);
        let _ = writeln!(out, "max_copies={}", self.max_copies);
        let _ = writeln!(out, "subfolders={}", u8::from(self.include_subfolders));
        let _ = writeln!(out, "hidden={}", u8::from(self.include_hidden));
        let _ = writeln!(out, "notifications={}", u8::from(self.show_notifications));
        out
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.destination.as_os_str().is_empty() {
            return Err(SettingsError::EmptyDestination);
        }
        if !(MIN_INTERVAL_SECS..=MAX_INTERVAL_SECS).contains(&self.interval_secs) {
            return Err(SettingsError::IntervalOutOfRange(self.interval_secs));
        }
        if self.max_copies == 0 {
            return Err(SettingsError::ZeroMaxCopies);
        }
        Ok(())
    }

    /// Timer period for automatic backups, clamped to the supported range.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.clamp(MIN_INTERVAL_SECS, MAX_INTERVAL_SECS))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    value.trim().parse::<i64>().ok().map(|v| v != 0)
}
