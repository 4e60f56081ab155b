//! Configuration types for the refresh scheduler.

use crate::error::{RefreshError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefresherConfig {
    /// Advisory lower bound (seconds) offered when a tab has no saved preference.
    pub default_min_interval_secs: u64,
    /// Advisory upper bound (seconds) offered when a tab has no saved preference.
    pub default_max_interval_secs: u64,
    /// URLs that are never reopened after their tab closes.
    pub placeholder_urls: Vec<String>,
    /// URL stored when `start` receives an empty URL.
    pub new_tab_url: String,
    /// Timer names are `<timer_prefix><tab id>`.
    pub timer_prefix: String,
    /// Host command request queue capacity.
    pub request_capacity: usize,
    /// Host event broadcast capacity.
    pub event_capacity: usize,
    /// How long a host tab call waits for its `TAB_CALL_RESULT`.
    pub tab_call_timeout_ms: u64,
    /// File name of the persistent settings store inside the data directory.
    pub store_file: String,
}

impl Default for RefresherConfig {
    fn default() -> Self {
        Self {
            default_min_interval_secs: 60,
            default_max_interval_secs: 120,
            placeholder_urls: vec![
                String::new(),
                "chrome://newtab/".to_owned(),
                "about:blank".to_owned(),
                "about:newtab".to_owned(),
            ],
            new_tab_url: "chrome://newtab/".to_owned(),
            timer_prefix: "refresh-tab-".to_owned(),
            request_capacity: 64,
            event_capacity: 128,
            tab_call_timeout_ms: 10_000,
            store_file: "settings.json".to_owned(),
        }
    }
}

impl RefresherConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| RefreshError::Config(e.to_string()))
    }

    /// Load from `path` when it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| RefreshError::Config(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| RefreshError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::app_dirs::config_file()
    }

    /// Reply timeout for host tab calls.
    #[must_use]
    pub fn tab_call_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.tab_call_timeout_ms)
    }

    /// Path of the persistent settings store.
    #[must_use]
    pub fn store_path(&self) -> PathBuf {
        crate::app_dirs::data_dir().join(&self.store_file)
    }

    /// Validates this configuration.
    ///
    /// Checks:
    /// - both default intervals are greater than 0
    /// - `default_min_interval_secs` <= `default_max_interval_secs`
    /// - channel capacities are greater than 0
    /// - `tab_call_timeout_ms` is greater than 0
    /// - `timer_prefix` and `store_file` are not empty
    pub fn validate(&self) -> Result<()> {
        if self.default_min_interval_secs == 0 || self.default_max_interval_secs == 0 {
            return Err(RefreshError::Config(
                "default intervals must be greater than 0".into(),
            ));
        }
        if self.default_min_interval_secs > self.default_max_interval_secs {
            return Err(RefreshError::Config(
                "default_min_interval_secs must be <= default_max_interval_secs".into(),
            ));
        }
        if self.request_capacity == 0 || self.event_capacity == 0 {
            return Err(RefreshError::Config(
                "channel capacities must be greater than 0".into(),
            ));
        }
        if self.tab_call_timeout_ms == 0 {
            return Err(RefreshError::Config(
                "tab_call_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.timer_prefix.is_empty() {
            return Err(RefreshError::Config("timer_prefix cannot be empty".into()));
        }
        if self.store_file.trim().is_empty() {
            return Err(RefreshError::Config("store_file cannot be empty".into()));
        }
        Ok(())
    }
}
