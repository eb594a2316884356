//! Settings for the ScaleWiz controller.
//!
//! Settings hold the default experiment parameters applied to new projects,
//! the most recently used analyst/project, and device policy knobs. They are
//! persisted as TOML under the user's configuration directory.
//!
//! # Settings Management
//!
//! The `SettingsManager` provides thread-safe access to `Settings`:
//! - Uses `Arc<RwLock<Settings>>` for parallel reads
//! - Persists state to `<config dir>/scalewiz/config.toml`
//! - Falls back to defaults when the file is missing or malformed

pub mod loader;

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

/// Default experiment parameters applied to new projects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub baseline: u32,
    /// Seconds between readings
    pub reading_interval: f64,
    /// Minutes
    pub time_limit: f64,
    /// psi
    pub pressure_limit: u32,
    pub output_format: String,
    pub test_temperature: f64,
    /// mL/min
    pub flowrate: f64,
    /// Seconds
    pub uptake_time: f64,
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            baseline: 75,
            reading_interval: 3.0,
            time_limit: 90.0,
            pressure_limit: 1500,
            output_format: "CSV".to_string(),
            test_temperature: 71.0,
            flowrate: 15.0,
            uptake_time: 60.0,
        }
    }
}

impl Defaults {
    /// Make every numeric default usable: negatives are flipped, and a
    /// reading interval must never be <= 0.
    pub fn sanitized(mut self) -> Self {
        self.reading_interval = self.reading_interval.abs();
        self.time_limit = self.time_limit.abs();
        self.test_temperature = self.test_temperature.abs();
        self.flowrate = self.flowrate.abs();
        self.uptake_time = self.uptake_time.abs();
        if self.reading_interval <= 0.0 || !self.reading_interval.is_finite() {
            self.reading_interval = 1.0;
        }
        self
    }
}

/// Most recently used values, remembered across sessions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recents {
    pub analyst: String,
    pub project: String,
}

/// Device policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Extra attempts after a failed pressure read before the run is faulted.
    pub read_retries: u32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings { read_retries: 2 }
    }
}

/// Persisted application settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub defaults: Defaults,
    pub recents: Recents,
    pub devices: DeviceSettings,
}

impl Settings {
    /// Remember the analyst and project path of a successfully saved project.
    pub fn remember_project(&mut self, analyst: &str, project_path: &Path) {
        self.recents.analyst = analyst.to_string();
        self.recents.project = project_path.display().to_string();
    }
}

/// Thread-safe settings manager for `Settings` persistence
pub struct SettingsManager;

impl SettingsManager {
    /// Load settings from the default location, or return defaults if the file doesn't exist
    pub fn load() -> Result<Settings, ConfigError> {
        let path = loader::get_global_settings_path()?;
        Ok(Self::load_from(&path))
    }

    /// Load settings from `path`.
    ///
    /// ERROR HANDLING: a missing or unparsable file logs a warning and
    /// yields defaults instead of failing.
    pub fn load_from(path: &Path) -> Settings {
        match loader::load_settings_from_file(path) {
            Ok(mut settings) => {
                settings.defaults = settings.defaults.sanitized();
                settings
            }
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("[Config] No settings at {}, using defaults", path.display());
                Settings::default()
            }
            Err(e) => {
                log::warn!(
                    "[Config] Failed to read {}, falling back to defaults: {}",
                    path.display(),
                    e
                );
                Settings::default()
            }
        }
    }

    /// Save settings to the default location
    pub fn save(settings: &Settings) -> Result<(), ConfigError> {
        loader::ensure_settings_dir_exists()?;
        let path = loader::get_global_settings_path()?;
        loader::save_settings_to_file(settings, &path)
    }

    /// Create a thread-safe shared instance of Settings
    pub fn new_shared() -> Result<Arc<RwLock<Settings>>, ConfigError> {
        let settings = Self::load()?;
        Ok(Arc::new(RwLock::new(settings)))
    }
}
