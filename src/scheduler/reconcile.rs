//! Reconciliation decisions for timer fires and tab lifecycle events.
//!
//! # Fire state machine
//!
//! ```text
//!  task absent ─────────────────────────────► Discard
//!  Open ────────────────────────────────────► Probe
//!  Open, probe Live ────────────────────────► Reload (then re-arm)
//!  Open, probe Gone ──┐
//!  ClosedPending ─────┴─► reopen disabled ──► Delete
//!                         placeholder url ──► Delete
//!                         otherwise ────────► Reopen under a new id
//! ```
//!
//! Everything here is pure; side effects live in [`crate::service`].

use crate::error::Result;
use crate::scheduler::tasks::{RefreshTask, TaskState};
use crate::tabs::{TabChange, TabInfo};

/// Outcome of a liveness fetch. Discarded tabs count as gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Live(TabInfo),
    Gone,
}

impl Probe {
    /// Fold a tab-directory fetch into a liveness verdict.
    #[must_use]
    pub fn from_fetch(fetched: Result<TabInfo>) -> Self {
        match fetched {
            Ok(tab) if !tab.discarded => Self::Live(tab),
            _ => Self::Gone,
        }
    }
}

/// Why a task was dropped instead of reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReason {
    ReopenDisabled,
    PlaceholderUrl,
}

impl DeleteReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReopenDisabled => "reopen_disabled",
            Self::PlaceholderUrl => "placeholder_url",
        }
    }
}

/// How a task leaves the fire handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Tab is live: refresh metadata, reload, re-arm.
    Reload(TabInfo),
    /// Remove the task and its timer.
    Delete(DeleteReason),
    /// Remove the task and recreate its tab at `url` under a new id.
    Reopen { url: String },
}

/// First step for a fired timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirePlan {
    /// No task for this id: drop the event.
    Discard,
    /// Task believed open: fetch the tab, then [`resolve_probe`].
    Probe,
    /// Task already closed: no fetch needed.
    Resolve(Resolution),
}

/// Global reopen policy threaded into every decision.
#[derive(Debug, Clone, Copy)]
pub struct ReopenPolicy<'a> {
    pub reopen_closed_tabs: bool,
    pub placeholder_urls: &'a [String],
}

impl ReopenPolicy<'_> {
    fn is_placeholder(&self, url: &str) -> bool {
        let url = url.trim();
        url.is_empty() || self.placeholder_urls.iter().any(|p| p == url)
    }
}

/// Plan the handling of a fired timer from the task snapshot.
#[must_use]
pub fn plan_fire(task: Option<&RefreshTask>, policy: ReopenPolicy<'_>) -> FirePlan {
    let Some(task) = task else {
        return FirePlan::Discard;
    };
    match task.state {
        TaskState::Open => FirePlan::Probe,
        TaskState::ClosedPendingResolution => FirePlan::Resolve(resolve_closed(task, policy)),
    }
}

/// Finish a [`FirePlan::Probe`] with the fetch result.
#[must_use]
pub fn resolve_probe(task: &RefreshTask, probe: Probe, policy: ReopenPolicy<'_>) -> Resolution {
    match probe {
        Probe::Live(tab) => Resolution::Reload(tab),
        Probe::Gone => resolve_closed(task, policy),
    }
}

/// Resolution of a task whose tab is gone.
#[must_use]
pub fn resolve_closed(task: &RefreshTask, policy: ReopenPolicy<'_>) -> Resolution {
    if !policy.reopen_closed_tabs {
        return Resolution::Delete(DeleteReason::ReopenDisabled);
    }
    if policy.is_placeholder(&task.url) {
        return Resolution::Delete(DeleteReason::PlaceholderUrl);
    }
    Resolution::Reopen {
        url: task.url.clone(),
    }
}

/// Copy changed title/url from a live tab into the task. Returns `true` if anything changed.
pub fn absorb_live_tab(task: &mut RefreshTask, tab: &TabInfo) -> bool {
    let mut changed = false;
    if !tab.title.is_empty() && task.title != tab.title {
        task.title.clone_from(&tab.title);
        changed = true;
    }
    if !tab.url.is_empty() && task.url != tab.url {
        task.url.clone_from(&tab.url);
        changed = true;
    }
    changed
}

/// Apply a tab-updated event. Returns `true` if the task changed.
///
/// A closed task showing real activity flips back to open.
pub fn apply_tab_change(task: &mut RefreshTask, change: &TabChange) -> bool {
    let mut changed = false;
    if let Some(title) = change.title.as_deref() {
        if !title.is_empty() && task.title != title {
            task.title = title.to_owned();
            changed = true;
        }
    }
    if let Some(url) = change.url.as_deref() {
        if !url.trim().is_empty() && task.url != url {
            task.url = url.to_owned();
            changed = true;
        }
    }
    if task.is_closed() && change.indicates_activity() {
        task.state = TaskState::Open;
        changed = true;
    }
    changed
}

/// Apply a tab-removed event: resolution is deferred to the next fire.
pub fn mark_removed(task: &mut RefreshTask) {
    task.state = TaskState::ClosedPendingResolution;
}
