//! Tab directory collaborator.
//!
//! The host tab system is reached through the [`TabDirectory`] trait and
//! reports lifecycle changes as [`TabEvent`]s.

use crate::error::Result;
use crate::scheduler::tasks::TabId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Snapshot of a host tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub id: TabId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    /// Suspended by the host to save memory.
    #[serde(default)]
    pub discarded: bool,
}

/// Access to the host tab system.
#[async_trait]
pub trait TabDirectory: Send + Sync + 'static {
    /// Fetch the current state of `tab_id`. Fails when the tab no longer exists.
    async fn get(&self, tab_id: TabId) -> Result<TabInfo>;
    /// Reload `tab_id`.
    async fn reload(&self, tab_id: TabId) -> Result<()>;
    /// Open a new tab at `url`; `active = false` keeps it in the background.
    async fn create(&self, url: &str, active: bool) -> Result<TabInfo>;
}

/// Page load status reported with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Loading,
    Complete,
}

/// Fields changed by a tab update. Absent fields did not change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabChange {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub status: Option<LoadStatus>,
}

impl TabChange {
    /// Navigation finished or the URL moved: the tab is in use again.
    #[must_use]
    pub fn indicates_activity(&self) -> bool {
        self.status == Some(LoadStatus::Complete)
            || self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

/// Lifecycle notification from the host tab system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabEvent {
    Updated { tab_id: TabId, change: TabChange },
    Removed { tab_id: TabId },
}

impl TabEvent {
    #[must_use]
    pub fn tab_id(&self) -> TabId {
        match self {
            Self::Updated { tab_id, .. } | Self::Removed { tab_id } => *tab_id,
        }
    }
}
