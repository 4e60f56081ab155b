//! In-memory task registry keyed by the current tab identifier.
//!
//! Callers that remove a task are responsible for disarming its timer.

use crate::scheduler::tasks::{RefreshTask, TabId};
use std::collections::HashMap;

/// Single source of truth for which tabs are monitored and how.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<TabId, RefreshTask>,
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the task stored under `tab_id`. Returns the replaced task.
    pub fn upsert(&mut self, tab_id: TabId, task: RefreshTask) -> Option<RefreshTask> {
        debug_assert_eq!(tab_id, task.tab_id, "registry key must match task id");
        self.tasks.insert(tab_id, task)
    }

    #[must_use]
    pub fn get(&self, tab_id: TabId) -> Option<&RefreshTask> {
        self.tasks.get(&tab_id)
    }

    pub fn remove(&mut self, tab_id: TabId) -> Option<RefreshTask> {
        self.tasks.remove(&tab_id)
    }

    /// All tasks ordered by tab id.
    #[must_use]
    pub fn list_all(&self) -> Vec<(TabId, RefreshTask)> {
        let mut all: Vec<_> = self
            .tasks
            .iter()
            .map(|(id, task)| (*id, task.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    /// Apply `mutator` to the task under `tab_id`. Returns `None` when absent.
    pub fn update_field<R>(
        &mut self,
        tab_id: TabId,
        mutator: impl FnOnce(&mut RefreshTask) -> R,
    ) -> Option<R> {
        self.tasks.get_mut(&tab_id).map(mutator)
    }

    #[must_use]
    pub fn contains(&self, tab_id: TabId) -> bool {
        self.tasks.contains_key(&tab_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
