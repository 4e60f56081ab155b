//! Persistent key-value settings store.
//!
//! Holds the global reopen-on-close flag and advisory per-tab interval
//! preferences. The scheduler core never reads interval preferences back;
//! they only seed the UI.

use crate::error::{RefreshError, Result};
use crate::scheduler::tasks::TabId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Storage key of the global reopen-on-close flag.
pub const REOPEN_SETTING_KEY: &str = "reopenClosedTabsSetting";

/// Storage key of a tab's preferred minimum interval (seconds).
#[must_use]
pub fn interval_min_key(tab_id: TabId) -> String {
    format!("tab_{tab_id}_min")
}

/// Storage key of a tab's preferred maximum interval (seconds).
#[must_use]
pub fn interval_max_key(tab_id: TabId) -> String {
    format!("tab_{tab_id}_max")
}

/// Asynchronous key-value store with JSON values.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// Volatile [`KeyValueStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_owned(), value);
        Ok(())
    }
}

/// [`KeyValueStore`] persisted as one pretty-printed JSON object.
pub struct JsonFileStore {
    path: PathBuf,
    values: tokio::sync::Mutex<BTreeMap<String, Value>>,
}

impl JsonFileStore {
    /// Open the store at `path`. A missing or unparseable file starts empty;
    /// an unparseable one is replaced by the next successful `set`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = load_values(&path)?;
        debug!(path = %path.display(), entries = values.len(), "opened settings store");
        Ok(Self {
            path,
            values: tokio::sync::Mutex::new(values),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn load_values(path: &Path) -> Result<BTreeMap<String, Value>> {
    let bytes = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(RefreshError::Store(format!("cannot read store: {e}"))),
    };
    match serde_json::from_slice(&bytes) {
        Ok(values) => Ok(values),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "settings store is corrupt; starting empty");
            Ok(BTreeMap::new())
        }
    }
}

/// Sibling path the store is staged at before it replaces `path`.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        // Held across the write so concurrent sets land in order.
        let mut values = self.values.lock().await;
        values.insert(key.to_owned(), value);

        let json = serde_json::to_string_pretty(&*values)
            .map_err(|e| RefreshError::Store(format!("cannot serialize store: {e}")))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RefreshError::Store(format!("cannot create store dir: {e}")))?;
        }
        let tmp_path = staging_path(&self.path);
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| RefreshError::Store(format!("cannot write store temp file: {e}")))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| RefreshError::Store(format!("cannot finalize store file: {e}")))?;
        Ok(())
    }
}

/// Typed access to the settings the scheduler persists.
#[derive(Clone)]
pub struct SettingsStore {
    kv: Arc<dyn KeyValueStore>,
}

impl SettingsStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Read the reopen-on-close flag. A missing or non-boolean value is
    /// replaced by `false` in the store.
    pub async fn load_reopen_closed_tabs(&self) -> Result<bool> {
        match self.kv.get(REOPEN_SETTING_KEY).await? {
            Some(Value::Bool(reopen)) => {
                info!(reopen, "loaded reopen-closed-tabs setting");
                Ok(reopen)
            }
            _ => {
                self.kv.set(REOPEN_SETTING_KEY, Value::Bool(false)).await?;
                info!("reopen-closed-tabs setting not found; initialized to false");
                Ok(false)
            }
        }
    }

    pub async fn save_reopen_closed_tabs(&self, reopen: bool) -> Result<()> {
        self.kv.set(REOPEN_SETTING_KEY, Value::Bool(reopen)).await
    }

    /// Remember the interval a tab was last started with (seconds).
    pub async fn save_interval_prefs(&self, tab_id: TabId, min_secs: u64, max_secs: u64) -> Result<()> {
        self.kv
            .set(&interval_min_key(tab_id), Value::from(min_secs))
            .await?;
        self.kv
            .set(&interval_max_key(tab_id), Value::from(max_secs))
            .await
    }

    /// Saved `(min, max)` seconds for a tab, if both are stored.
    pub async fn interval_prefs(&self, tab_id: TabId) -> Result<Option<(u64, u64)>> {
        let min = self.kv.get(&interval_min_key(tab_id)).await?;
        let max = self.kv.get(&interval_max_key(tab_id)).await?;
        Ok(match (min.and_then(|v| v.as_u64()), max.and_then(|v| v.as_u64())) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        })
    }
}
