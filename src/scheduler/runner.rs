//! Arming and disarming the per-task refresh timer.
//!
//! The [`Scheduler`] is the only writer of the task -> timer relationship:
//! `arm` always clears the task's timer name before creating a new entry, so
//! a task never has more than one pending timer.

use crate::scheduler::registry::TaskRegistry;
use crate::scheduler::tasks::{IntervalBounds, RefreshTask, TabId, timer_name};
use crate::scheduler::timer::{Clock, TimerFacility};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a successful [`Scheduler::arm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub tab_id: TabId,
    /// Randomized delay that was drawn.
    pub delay_ms: u64,
    /// Absolute deadline (epoch ms).
    pub fire_at_ms: u64,
}

/// Computes randomized deadlines and owns the timer entries.
#[derive(Clone)]
pub struct Scheduler {
    timers: Arc<dyn TimerFacility>,
    clock: Arc<dyn Clock>,
    timer_prefix: String,
}

impl Scheduler {
    pub fn new(
        timers: Arc<dyn TimerFacility>,
        clock: Arc<dyn Clock>,
        timer_prefix: impl Into<String>,
    ) -> Self {
        Self {
            timers,
            clock,
            timer_prefix: timer_prefix.into(),
        }
    }

    #[must_use]
    pub fn timer_prefix(&self) -> &str {
        &self.timer_prefix
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Arm the timer for the task stored under `tab_id`.
    ///
    /// Returns `None` (and touches no timer) when no such task exists.
    pub fn arm(&self, registry: &TaskRegistry, tab_id: TabId) -> Option<ArmedTimer> {
        self.arm_with_rng(registry, tab_id, &mut rand::thread_rng())
    }

    /// [`Scheduler::arm`] with a caller-supplied random source.
    pub fn arm_with_rng<R: Rng + ?Sized>(
        &self,
        registry: &TaskRegistry,
        tab_id: TabId,
        rng: &mut R,
    ) -> Option<ArmedTimer> {
        let Some(task) = registry.get(tab_id) else {
            warn!(tab_id = %tab_id, "arm requested for unknown task; ignoring");
            return None;
        };

        let delay_ms = draw_delay_ms(task.interval, rng);
        let fire_at_ms = self.clock.now_ms().saturating_add(delay_ms);

        self.timers.clear(&task.timer_name);
        self.timers.create(&task.timer_name, fire_at_ms);

        debug!(
            tab_id = %tab_id,
            title = %task.title,
            url = %task.url,
            delay_ms,
            timer = %task.timer_name,
            "next refresh scheduled"
        );

        Some(ArmedTimer {
            tab_id,
            delay_ms,
            fire_at_ms,
        })
    }

    /// Cancel the timer for `tab_id`. No-op when nothing is pending.
    pub fn disarm(&self, tab_id: TabId) -> bool {
        self.timers.clear(&timer_name(&self.timer_prefix, tab_id))
    }

    /// Deadline of the task's pending timer, if one exists.
    #[must_use]
    pub fn scheduled_time(&self, task: &RefreshTask) -> Option<u64> {
        self.timers.scheduled_time(&task.timer_name)
    }

    /// Milliseconds until the task's timer fires (saturating at 0), if pending.
    #[must_use]
    pub fn time_left_ms(&self, task: &RefreshTask) -> Option<u64> {
        self.scheduled_time(task)
            .map(|when| when.saturating_sub(self.clock.now_ms()))
    }
}

/// Draw a delay uniformly from `[min, max]`: `min + unit * (max - min)` with `unit` in `[0, 1)`.
pub fn draw_delay_ms<R: Rng + ?Sized>(bounds: IntervalBounds, rng: &mut R) -> u64 {
    let width = bounds.width_ms();
    if width == 0 {
        return bounds.min_ms();
    }
    let unit: f64 = rng.r#gen::<f64>();
    delay_from_unit(bounds, unit)
}

fn delay_from_unit(bounds: IntervalBounds, unit: f64) -> u64 {
    let offset = (unit.clamp(0.0, 1.0) * bounds.width_ms() as f64) as u64;
    bounds.min_ms() + offset.min(bounds.width_ms())
}
