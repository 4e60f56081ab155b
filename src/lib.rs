//! Tab refresh scheduler.
//!
//! Reloads monitored browser tabs at a randomized delay drawn from a
//! per-tab `[min, max]` window, and optionally recreates a monitored tab
//! after the user closes it.
//!
//! # Architecture
//!
//! - **Scheduler core** ([`scheduler`]): task registry, one named timer per
//!   task, and the pure reconciliation table for timer fires and tab events
//! - **Service** ([`service`]): the control surface and fire handlers over
//!   the [`tabs::TabDirectory`], [`scheduler::TimerFacility`] and
//!   [`store::KeyValueStore`] collaborators
//! - **Host bridge** ([`host`]): versioned JSON envelopes over stdin/stdout;
//!   tab operations round-trip through the host as `tab.call` events

pub mod app_dirs;
pub mod config;
pub mod error;
pub mod host;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod tabs;

pub use config::RefresherConfig;
pub use error::{RefreshError, Result};
pub use service::{FireOutcome, RefreshEvent, RefreshService, ServiceDeps, StartRequest, TaskStatus};
