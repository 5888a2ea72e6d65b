//! Persisted control settings: a flat JSON key-value file.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde_json::{Map, Value};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use crate::command::ControlSettings;
use crate::protocol::{BRIGHTNESS_RANGE, DEFAULT_BRIGHTNESS, DEFAULT_SENSITIVITY, SENSITIVITY_RANGE};

/// Key holding the input sensitivity (0–100).
pub const SENSITIVITY_KEY: &str = "av.sensitivity";
/// Key holding the LED brightness (0–255).
pub const BRIGHTNESS_KEY: &str = "av.led";

/// Default file name, next to the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "audiovisor-settings.json";

/// Flat JSON key-value file shared with the rest of the dashboard.
///
/// Only the two control keys belong to this crate; other keys are kept as-is
/// and written back untouched.
pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<Map<String, Value>>,
}

impl SettingsStore {
    /// Open `path`. A missing or unparsable file starts out empty.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(map) => map,
                Err(e) => {
                    warn!("{}: ignoring corrupt settings ({e})", path.display());
                    Map::new()
                }
            }
        } else {
            debug!("{}: no settings file yet", path.display());
            Map::new()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(key.to_owned(), value);
        self.persist(&guard)
    }

    /// Stored control settings, falling back to the defaults per key.
    ///
    /// Out-of-range numbers are clamped; non-numeric values count as missing.
    pub fn control_settings(&self) -> ControlSettings {
        let guard = self.data.read().unwrap_or_else(PoisonError::into_inner);
        let read = |key: &str, default: u8, (min, max): (i64, i64)| -> i64 {
            guard
                .get(key)
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite())
                .map(|v| (v.round() as i64).clamp(min, max))
                .unwrap_or(i64::from(default))
        };
        ControlSettings::clamped(
            read(SENSITIVITY_KEY, DEFAULT_SENSITIVITY, SENSITIVITY_RANGE),
            read(BRIGHTNESS_KEY, DEFAULT_BRIGHTNESS, BRIGHTNESS_RANGE),
        )
    }

    pub fn save_control_settings(&self, settings: ControlSettings) -> Result<()> {
        let mut guard = self.data.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(SENSITIVITY_KEY.into(), Value::from(settings.sensitivity));
        guard.insert(BRIGHTNESS_KEY.into(), Value::from(settings.brightness));
        self.persist(&guard)
    }

    fn persist(&self, data: &Map<String, Value>) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    /// Re-read the file, replacing the in-memory copy.
    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: Map<String, Value> = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid settings JSON in {}", self.path.display()))?;
        *self.data.write().unwrap_or_else(PoisonError::into_inner) = data;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("s.json")).unwrap();
        assert_eq!(store.control_settings(), ControlSettings::default());
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        fs::write(&path, r#"{"av.sensitivity": 400, "av.led": -3, "theme": "dark"}"#).unwrap();
        let store = SettingsStore::new(&path).unwrap();
        assert_eq!(
            store.control_settings(),
            ControlSettings { sensitivity: 100, brightness: 0 }
        );
        assert_eq!(store.get("theme"), Some(json!("dark")));
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        fs::write(&path, "{not json").unwrap();
        let store = SettingsStore::new(&path).unwrap();
        assert_eq!(store.control_settings(), ControlSettings::default());
        assert!(store.reload().is_err());
    }
}
