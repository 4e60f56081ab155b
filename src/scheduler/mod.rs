//! Per-tab refresh scheduling.
//!
//! Tasks live in the [`TaskRegistry`]; the [`Scheduler`] arms one named
//! timer per task; [`reconcile`] decides what a fired timer or a tab
//! lifecycle event does to a task.

pub mod reconcile;
pub mod registry;
pub mod runner;
pub mod tasks;
pub mod timer;

pub use registry::TaskRegistry;
pub use runner::{ArmedTimer, Scheduler};
pub use tasks::{IntervalBounds, RefreshTask, TabId, TaskState};
pub use timer::{Clock, SystemClock, TimerFacility, TimerFired, TokioTimerFacility};
