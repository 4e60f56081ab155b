//! Refresh task definitions.
//!
//! Defines the [`RefreshTask`] registry entry, its [`TaskState`], the
//! validated [`IntervalBounds`] and the [`TabId`] key.

use crate::error::{RefreshError, Result};
use serde::{Deserialize, Serialize};

/// Milliseconds per second at the control-surface boundary.
pub const MS_PER_SEC: u64 = 1000;

/// Host-assigned tab identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub u64);

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TabId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Refresh interval range in milliseconds, `0 < min <= max`.
///
/// Fields are private so no mutation can break the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawBounds")]
pub struct IntervalBounds {
    min_ms: u64,
    max_ms: u64,
}

#[derive(Deserialize)]
struct RawBounds {
    min_ms: u64,
    max_ms: u64,
}

impl TryFrom<RawBounds> for IntervalBounds {
    type Error = RefreshError;

    fn try_from(raw: RawBounds) -> Result<Self> {
        Self::from_millis(raw.min_ms, raw.max_ms)
    }
}

impl IntervalBounds {
    /// Build bounds from milliseconds, rejecting zero or inverted ranges.
    pub fn from_millis(min_ms: u64, max_ms: u64) -> Result<Self> {
        if min_ms == 0 || min_ms > max_ms {
            return Err(RefreshError::InvalidInterval { min_ms, max_ms });
        }
        Ok(Self { min_ms, max_ms })
    }

    /// Build bounds from seconds as they cross the control surface.
    ///
    /// Seconds that do not fit in milliseconds are rejected rather than clamped.
    pub fn from_secs(min_secs: u64, max_secs: u64) -> Result<Self> {
        match (
            min_secs.checked_mul(MS_PER_SEC),
            max_secs.checked_mul(MS_PER_SEC),
        ) {
            (Some(min_ms), Some(max_ms)) => Self::from_millis(min_ms, max_ms),
            _ => Err(RefreshError::InvalidInterval {
                min_ms: min_secs.saturating_mul(MS_PER_SEC),
                max_ms: max_secs.saturating_mul(MS_PER_SEC),
            }),
        }
    }

    #[must_use]
    pub fn min_ms(&self) -> u64 {
        self.min_ms
    }

    #[must_use]
    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    #[must_use]
    pub fn min_secs(&self) -> u64 {
        self.min_ms / MS_PER_SEC
    }

    #[must_use]
    pub fn max_secs(&self) -> u64 {
        self.max_ms / MS_PER_SEC
    }

    /// Width of the range in milliseconds (zero for a constant interval).
    #[must_use]
    pub fn width_ms(&self) -> u64 {
        self.max_ms - self.min_ms
    }
}

impl std::fmt::Display for IntervalBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.min_ms == self.max_ms {
            write!(f, "every {}s", self.min_secs())
        } else {
            write!(f, "every {}-{}s", self.min_secs(), self.max_secs())
        }
    }
}

/// Lifecycle state of a monitored tab as seen by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// The tab is believed live.
    #[default]
    Open,
    /// The host reported the tab removed; the next timer fire resolves it.
    ClosedPendingResolution,
}

impl TaskState {
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, Self::ClosedPendingResolution)
    }
}

/// One monitored tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTask {
    /// Current tab identifier (the registry key).
    pub tab_id: TabId,
    /// Randomized interval range.
    pub interval: IntervalBounds,
    /// Name of the single timer entry owned by this task.
    pub timer_name: String,
    /// Best-known display title (advisory).
    pub title: String,
    /// Best-known URL; also the reopen target.
    pub url: String,
    /// Open or awaiting resolution.
    pub state: TaskState,
}

impl RefreshTask {
    /// Create a new open task with a timer name derived from `tab_id`.
    pub fn new(
        tab_id: TabId,
        interval: IntervalBounds,
        timer_prefix: &str,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            tab_id,
            interval,
            timer_name: timer_name(timer_prefix, tab_id),
            title: title.into(),
            url: url.into(),
            state: TaskState::Open,
        }
    }

    /// Copy of this task re-keyed to a freshly created tab.
    #[must_use]
    pub fn rekeyed(&self, new_id: TabId, timer_prefix: &str) -> Self {
        Self::new(
            new_id,
            self.interval,
            timer_prefix,
            self.title.clone(),
            self.url.clone(),
        )
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

/// Deterministic timer name for a tab.
#[must_use]
pub fn timer_name(prefix: &str, tab_id: TabId) -> String {
    format!("{prefix}{tab_id}")
}

/// Recover the tab id from a timer name, if it carries `prefix`.
#[must_use]
pub fn parse_timer_name(prefix: &str, name: &str) -> Option<TabId> {
    name.strip_prefix(prefix)?.parse::<u64>().ok().map(TabId)
}
