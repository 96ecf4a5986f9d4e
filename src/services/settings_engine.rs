// marksync Settings Engine
// Loads, saves, updates and resets the sync settings.
// Settings are stored as a JSON file at the platform-specific config path.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::platform;
use crate::types::errors::SettingsError;
use crate::types::settings::{BackendMode, SyncSettings};

/// Environment variable overriding `backend.url`.
pub const ENV_BACKEND_URL: &str = "MARKSYNC_URL";
/// Environment variable overriding `backend.anon_key`.
pub const ENV_ANON_KEY: &str = "MARKSYNC_ANON_KEY";

/// Trait defining the settings engine interface.
pub trait SettingsEngineTrait {
    fn load(&mut self) -> Result<SyncSettings, SettingsError>;
    fn save(&self) -> Result<(), SettingsError>;
    fn get_settings(&self) -> &SyncSettings;
    fn set_value(&mut self, key: &str, value: serde_json::Value) -> Result<(), SettingsError>;
    fn reset(&mut self) -> Result<(), SettingsError>;
    fn get_config_path(&self) -> &str;
}

/// Values taken from the environment at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct EnvOverrides {
    url: Option<String>,
    anon_key: Option<String>,
}

/// Settings engine implementation that persists settings as JSON on disk.
///
/// `stored` mirrors the file; `settings` is what the rest of the crate reads,
/// `stored` with the environment overrides on top.
pub struct SettingsEngine {
    config_path: String,
    stored: SyncSettings,
    overrides: EnvOverrides,
    settings: SyncSettings,
}

impl SettingsEngine {
    /// Creates a new SettingsEngine.
    ///
    /// If `path_override` is `Some`, uses that path for the config file.
    /// Otherwise, uses the platform-specific config directory with `settings.json`.
    pub fn new(path_override: Option<String>) -> Self {
        let config_path = match path_override {
            Some(p) => p,
            None => platform::get_config_dir()
                .join("settings.json")
                .to_string_lossy()
                .to_string(),
        };

        Self {
            config_path,
            stored: SyncSettings::default(),
            overrides: EnvOverrides::default(),
            settings: SyncSettings::default(),
        }
    }

    /// Applies `MARKSYNC_URL` / `MARKSYNC_ANON_KEY` on top of the loaded file.
    ///
    /// Setting a backend URL through the environment implies REST mode.
    /// Overrides live in memory only and are never written back by `save`;
    /// they survive `load`, `set_value` and `reset`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_BACKEND_URL).ok(),
            std::env::var(ENV_ANON_KEY).ok(),
        );
    }

    /// Sets the override layer directly, as `apply_env_overrides` does from
    /// the process environment.
    pub fn apply_overrides(&mut self, url: Option<String>, anon_key: Option<String>) {
        self.overrides = EnvOverrides {
            url: url.filter(|u| !u.trim().is_empty()),
            anon_key: anon_key.filter(|k| !k.is_empty()),
        };
        if let Some(url) = &self.overrides.url {
            debug!(url = %url, "backend url from environment");
        }
        self.rebuild();
    }

    /// Settings as stored in the file, without overrides.
    pub fn stored_settings(&self) -> &SyncSettings {
        &self.stored
    }

    fn rebuild(&mut self) {
        let mut settings = self.stored.clone();
        if let Some(url) = &self.overrides.url {
            settings.backend.url = url.clone();
            settings.backend.mode = BackendMode::Rest;
        }
        if let Some(key) = &self.overrides.anon_key {
            settings.backend.anon_key = key.clone();
        }
        self.settings = settings;
    }

    /// Path of the embedded database: `backend.database_path` or
    /// `<data dir>/marksync.db`.
    pub fn database_path(&self) -> String {
        match &self.settings.backend.database_path {
            Some(path) => path.clone(),
            None => platform::get_data_dir()
                .join("marksync.db")
                .to_string_lossy()
                .to_string(),
        }
    }
}

impl SettingsEngineTrait for SettingsEngine {
    /// Loads settings from the JSON config file.
    ///
    /// If the file does not exist, returns default settings.
    /// If the file exists but is malformed, returns a serialization error.
    fn load(&mut self) -> Result<SyncSettings, SettingsError> {
        let path = Path::new(&self.config_path);

        if !path.exists() {
            self.stored = SyncSettings::default();
            self.rebuild();
            return Ok(self.settings.clone());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| SettingsError::IoError(format!("Failed to read config file: {}", e)))?;

        let settings: SyncSettings = serde_json::from_str(&content).map_err(|e| {
            SettingsError::SerializationError(format!("Failed to parse config file: {}", e))
        })?;

        self.stored = settings;
        self.rebuild();
        Ok(self.settings.clone())
    }

    /// Saves the stored settings to the JSON config file. Environment
    /// overrides are not written.
    ///
    /// Creates parent directories if they don't exist.
    fn save(&self) -> Result<(), SettingsError> {
        let path = Path::new(&self.config_path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                SettingsError::IoError(format!("Failed to create config directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(&self.stored).map_err(|e| {
            SettingsError::SerializationError(format!("Failed to serialize settings: {}", e))
        })?;

        fs::write(path, json)
            .map_err(|e| SettingsError::IoError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    fn get_settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Updates an individual setting by dot-notation key path and saves.
    ///
    /// # Examples
    /// - `"backend.mode"` → updates `settings.backend.mode`
    /// - `"realtime.reconnect_max_attempts"` → updates `settings.realtime.reconnect_max_attempts`
    fn set_value(&mut self, key: &str, value: serde_json::Value) -> Result<(), SettingsError> {
        if key.is_empty() {
            return Err(SettingsError::InvalidKey("Key cannot be empty".to_string()));
        }

        let parts: Vec<&str> = key.split('.').collect();

        let mut json_value = serde_json::to_value(&self.stored).map_err(|e| {
            SettingsError::SerializationError(format!("Failed to serialize settings: {}", e))
        })?;

        {
            let mut current = &mut json_value;
            for (i, part) in parts.iter().enumerate() {
                if i == parts.len() - 1 {
                    match current {
                        serde_json::Value::Object(map) => {
                            if !map.contains_key(*part) {
                                return Err(SettingsError::InvalidKey(format!(
                                    "Key '{}' not found in settings",
                                    key
                                )));
                            }
                            map.insert(part.to_string(), value.clone());
                        }
                        _ => {
                            return Err(SettingsError::InvalidKey(format!(
                                "Cannot navigate to key '{}': intermediate value is not an object",
                                key
                            )));
                        }
                    }
                } else {
                    current = match current.get_mut(*part) {
                        Some(v) => v,
                        None => {
                            return Err(SettingsError::InvalidKey(format!(
                                "Key '{}' not found in settings",
                                key
                            )));
                        }
                    };
                }
            }
        }

        // Round-trip through the typed struct to validate the new value
        let new_settings: SyncSettings = serde_json::from_value(json_value).map_err(|e| {
            SettingsError::InvalidValue(format!("Invalid value for key '{}': {}", key, e))
        })?;

        self.stored = new_settings;
        self.rebuild();
        self.save()?;

        Ok(())
    }

    /// Resets all settings to defaults and saves to disk.
    fn reset(&mut self) -> Result<(), SettingsError> {
        self.stored = SyncSettings::default();
        self.rebuild();
        self.save()?;
        Ok(())
    }

    fn get_config_path(&self) -> &str {
        &self.config_path
    }
}
