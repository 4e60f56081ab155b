//! Application directory paths.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! # Environment Overrides
//!
//! - `TAB_REFRESH_CONFIG_DIR` overrides [`config_dir`]
//! - `TAB_REFRESH_DATA_DIR` overrides [`data_dir`]

use std::path::PathBuf;

/// Application config directory (holds `config.toml`).
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TAB_REFRESH_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("tab-refresh"))
        .unwrap_or_else(|| PathBuf::from("/tmp/tab-refresh-config"))
}

/// Application data directory (holds the persistent settings store).
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TAB_REFRESH_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("tab-refresh"))
        .unwrap_or_else(|| PathBuf::from("/tmp/tab-refresh-data"))
}

/// Default config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
