//! Refresh service: control operations, timer-fire handling and tab lifecycle.
//!
//! All registry state sits behind one mutex that is never held across an
//! `.await`. Fire handlers snapshot the task, await the tab directory, then
//! act on the snapshot, so a removal event racing with an in-flight fetch is
//! only observed by the next fire.

use crate::config::RefresherConfig;
use crate::error::{RefreshError, Result};
use crate::scheduler::reconcile::{
    self, DeleteReason, FirePlan, Probe, ReopenPolicy, Resolution,
};
use crate::scheduler::tasks::{IntervalBounds, RefreshTask, TabId, parse_timer_name};
use crate::scheduler::timer::{Clock, TimerFacility, TimerFired};
use crate::scheduler::{ArmedTimer, Scheduler, TaskRegistry};
use crate::store::SettingsStore;
use crate::tabs::{TabDirectory, TabEvent, TabInfo};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Status note attached when a task has no pending timer.
pub const RESCHEDULING_NOTE: &str = "Rescheduling...";

/// Collaborators the service is wired to.
#[derive(Clone)]
pub struct ServiceDeps {
    pub tabs: Arc<dyn TabDirectory>,
    pub timers: Arc<dyn TimerFacility>,
    pub clock: Arc<dyn Clock>,
    pub settings: SettingsStore,
}

/// Parameters of a `start` request (intervals in seconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub tab_id: TabId,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub title: String,
    pub url: String,
}

/// Display view of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    pub tab_id: TabId,
    pub title: String,
    pub url: String,
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    pub closed: bool,
    /// Milliseconds until the next fire; 0 when no timer is pending.
    pub time_left_ms: u64,
    pub status_note: Option<String>,
}

/// What a fired timer ended up doing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// Timer name did not belong to this scheduler.
    Ignored,
    /// No task for the id.
    Orphan,
    /// Tab reloaded and re-armed.
    Reloaded { next_fire_at_ms: u64 },
    /// Task removed.
    Deleted(DeleteReason),
    /// Tab recreated and monitoring moved to the new id.
    Reopened { new_tab_id: TabId },
    /// Tab creation failed; the task stays deleted.
    ReopenFailed,
    /// The task was stopped while the handler was suspended.
    Cancelled,
}

/// Notifications for UIs observing the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
    Started {
        tab_id: TabId,
        interval: IntervalBounds,
        next_fire_at_ms: u64,
    },
    Stopped {
        tab_id: TabId,
    },
    Reloaded {
        tab_id: TabId,
        next_fire_at_ms: u64,
    },
    Deleted {
        tab_id: TabId,
        reason: DeleteReason,
    },
    Reopened {
        old_tab_id: TabId,
        new_tab_id: TabId,
        url: String,
    },
    ReopenFailed {
        tab_id: TabId,
        url: String,
        error: String,
    },
    ReopenSettingChanged {
        reopen: bool,
    },
}

struct CoreState {
    registry: TaskRegistry,
    reopen_closed_tabs: bool,
}

struct ServiceInner {
    state: Mutex<CoreState>,
    scheduler: Scheduler,
    tabs: Arc<dyn TabDirectory>,
    settings: SettingsStore,
    config: RefresherConfig,
    events: broadcast::Sender<RefreshEvent>,
}

/// Cheaply cloneable handle to the scheduler core.
#[derive(Clone)]
pub struct RefreshService {
    inner: Arc<ServiceInner>,
}

impl RefreshService {
    /// Build the service and load the persisted reopen setting.
    pub async fn new(config: RefresherConfig, deps: ServiceDeps) -> Result<Self> {
        config.validate()?;
        let reopen_closed_tabs = deps.settings.load_reopen_closed_tabs().await?;
        Ok(Self::with_reopen_setting(config, deps, reopen_closed_tabs))
    }

    /// Build the service with an explicit reopen setting (no store read).
    pub fn with_reopen_setting(
        config: RefresherConfig,
        deps: ServiceDeps,
        reopen_closed_tabs: bool,
    ) -> Self {
        let scheduler = Scheduler::new(deps.timers, deps.clock, config.timer_prefix.clone());
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(ServiceInner {
                state: Mutex::new(CoreState {
                    registry: TaskRegistry::new(),
                    reopen_closed_tabs,
                }),
                scheduler,
                tabs: deps.tabs,
                settings: deps.settings,
                config,
                events,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RefresherConfig {
        &self.inner.config
    }

    /// Subscribe to lifecycle notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RefreshEvent> {
        self.inner.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: RefreshEvent) {
        let _ = self.inner.events.send(event);
    }

    // -----------------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------------

    /// Start (or restart) monitoring a tab.
    ///
    /// # Errors
    ///
    /// [`RefreshError::InvalidInterval`] unless `0 < min <= max`; nothing is
    /// created in that case.
    pub async fn start(&self, request: StartRequest) -> Result<ArmedTimer> {
        let interval =
            IntervalBounds::from_secs(request.min_interval_secs, request.max_interval_secs)?;
        let tab_id = request.tab_id;
        let title = if request.title.trim().is_empty() {
            format!("Tab {tab_id}")
        } else {
            request.title
        };
        let url = if request.url.trim().is_empty() {
            self.inner.config.new_tab_url.clone()
        } else {
            request.url
        };

        let armed = {
            let mut state = self.lock();
            let task = RefreshTask::new(
                tab_id,
                interval,
                self.inner.scheduler.timer_prefix(),
                title,
                url.clone(),
            );
            state.registry.upsert(tab_id, task);
            self.inner.scheduler.arm(&state.registry, tab_id)
        }
        .ok_or_else(|| RefreshError::Timer(format!("cannot arm timer for tab {tab_id}")))?;

        info!(tab_id = %tab_id, url = %url, interval = %interval, "refresh started");

        if let Err(e) = self
            .inner
            .settings
            .save_interval_prefs(tab_id, interval.min_secs(), interval.max_secs())
            .await
        {
            warn!(tab_id = %tab_id, error = %e, "cannot persist interval preferences");
        }

        self.emit(RefreshEvent::Started {
            tab_id,
            interval,
            next_fire_at_ms: armed.fire_at_ms,
        });
        Ok(armed)
    }

    /// Stop monitoring a tab. Returns `true` when a task existed.
    pub fn stop(&self, tab_id: TabId) -> bool {
        let removed = {
            let mut state = self.lock();
            let removed = state.registry.remove(tab_id);
            self.inner.scheduler.disarm(tab_id);
            removed
        };

        match removed {
            Some(task) => {
                info!(tab_id = %tab_id, url = %task.url, "refresh stopped");
                self.emit(RefreshEvent::Stopped { tab_id });
                true
            }
            None => {
                debug!(tab_id = %tab_id, "stop requested for unmonitored tab");
                false
            }
        }
    }

    /// Status of one task, if monitored.
    #[must_use]
    pub fn query_one(&self, tab_id: TabId) -> Option<TaskStatus> {
        let state = self.lock();
        state
            .registry
            .get(tab_id)
            .map(|task| self.status_of(task))
    }

    /// Status of every task, ordered by tab id. Never probes the tabs.
    #[must_use]
    pub fn query_all(&self) -> Vec<TaskStatus> {
        let state = self.lock();
        state
            .registry
            .list_all()
            .iter()
            .map(|(_, task)| self.status_of(task))
            .collect()
    }

    fn status_of(&self, task: &RefreshTask) -> TaskStatus {
        let time_left = self.inner.scheduler.time_left_ms(task);
        if time_left.is_none() {
            debug!(tab_id = %task.tab_id, timer = %task.timer_name, "no pending timer; assuming rescheduling");
        }
        TaskStatus {
            tab_id: task.tab_id,
            title: task.title.clone(),
            url: task.url.clone(),
            min_interval_secs: task.interval.min_secs(),
            max_interval_secs: task.interval.max_secs(),
            closed: task.is_closed(),
            time_left_ms: time_left.unwrap_or(0),
            status_note: time_left.is_none().then(|| RESCHEDULING_NOTE.to_owned()),
        }
    }

    /// Update the global reopen-on-close setting and persist it.
    ///
    /// The in-memory value changes first so the next fire sees it even if
    /// persisting fails.
    pub async fn set_global_reopen(&self, reopen: bool) -> Result<()> {
        self.lock().reopen_closed_tabs = reopen;
        self.emit(RefreshEvent::ReopenSettingChanged { reopen });
        info!(reopen, "reopen-closed-tabs setting updated");
        self.inner.settings.save_reopen_closed_tabs(reopen).await
    }

    #[must_use]
    pub fn global_reopen(&self) -> bool {
        self.lock().reopen_closed_tabs
    }

    /// Saved `(min, max)` seconds for a tab, or the configured defaults.
    pub async fn interval_prefs(&self, tab_id: TabId) -> Result<(u64, u64)> {
        let saved = self.inner.settings.interval_prefs(tab_id).await?;
        Ok(saved.unwrap_or((
            self.inner.config.default_min_interval_secs,
            self.inner.config.default_max_interval_secs,
        )))
    }

    // -----------------------------------------------------------------------
    // Tab lifecycle
    // -----------------------------------------------------------------------

    /// Apply a tab lifecycle event to the registry.
    pub fn handle_tab_event(&self, event: TabEvent) {
        let mut state = self.lock();
        match event {
            TabEvent::Removed { tab_id } => {
                match state.registry.update_field(tab_id, reconcile::mark_removed) {
                    Some(()) => info!(
                        tab_id = %tab_id,
                        "monitored tab removed; resolution deferred to next fire"
                    ),
                    None => debug!(tab_id = %tab_id, "removal of unmonitored tab ignored"),
                }
            }
            TabEvent::Updated { tab_id, change } => {
                match state
                    .registry
                    .update_field(tab_id, |task| reconcile::apply_tab_change(task, &change))
                {
                    Some(true) => debug!(tab_id = %tab_id, "task refreshed from tab update"),
                    Some(false) => {}
                    None => debug!(tab_id = %tab_id, "update of unmonitored tab ignored"),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timer fires
    // -----------------------------------------------------------------------

    /// Handle a fired timer by name.
    pub async fn handle_timer_fired(&self, fired: TimerFired) -> FireOutcome {
        let Some(tab_id) = parse_timer_name(self.inner.scheduler.timer_prefix(), &fired.name)
        else {
            debug!(timer = %fired.name, "ignoring foreign timer");
            return FireOutcome::Ignored;
        };
        self.handle_fire(tab_id).await
    }

    /// Reconcile the task for `tab_id` after its timer fired.
    pub async fn handle_fire(&self, tab_id: TabId) -> FireOutcome {
        let (snapshot, reopen_closed_tabs) = {
            let state = self.lock();
            let snapshot = state.registry.get(tab_id).cloned();
            if snapshot.is_none() {
                // Stale fire for a stopped task; disarm while no `start` can interleave.
                self.inner.scheduler.disarm(tab_id);
            }
            (snapshot, state.reopen_closed_tabs)
        };
        let policy = ReopenPolicy {
            reopen_closed_tabs,
            placeholder_urls: &self.inner.config.placeholder_urls,
        };

        let plan = reconcile::plan_fire(snapshot.as_ref(), policy);
        let Some(task) = snapshot else {
            debug!(tab_id = %tab_id, "orphan timer fire discarded");
            return FireOutcome::Orphan;
        };

        let resolution = match plan {
            FirePlan::Discard => return FireOutcome::Orphan,
            FirePlan::Resolve(resolution) => resolution,
            FirePlan::Probe => {
                let probe = Probe::from_fetch(self.inner.tabs.get(tab_id).await);
                if probe == Probe::Gone {
                    warn!(tab_id = %tab_id, "tab unreachable or discarded at fire time");
                }
                reconcile::resolve_probe(&task, probe, policy)
            }
        };

        match resolution {
            Resolution::Reload(tab) => self.reload(&task, tab, policy).await,
            Resolution::Delete(reason) => self.delete(tab_id, reason),
            Resolution::Reopen { url } => self.reopen(tab_id, url).await,
        }
    }

    async fn reload(&self, task: &RefreshTask, tab: TabInfo, policy: ReopenPolicy<'_>) -> FireOutcome {
        let tab_id = task.tab_id;
        {
            let mut state = self.lock();
            state
                .registry
                .update_field(tab_id, |t| reconcile::absorb_live_tab(t, &tab));
        }

        if let Err(e) = self.inner.tabs.reload(tab_id).await {
            warn!(tab_id = %tab_id, error = %e, "reload failed; treating tab as gone");
            return match reconcile::resolve_closed(task, policy) {
                Resolution::Reopen { url } => self.reopen(tab_id, url).await,
                Resolution::Delete(reason) => self.delete(tab_id, reason),
                Resolution::Reload(_) => FireOutcome::Cancelled,
            };
        }

        let armed = {
            let state = self.lock();
            self.inner.scheduler.arm(&state.registry, tab_id)
        };
        match armed {
            Some(armed) => {
                info!(
                    tab_id = %tab_id,
                    title = %tab.title,
                    delay_ms = armed.delay_ms,
                    "tab refreshed"
                );
                self.emit(RefreshEvent::Reloaded {
                    tab_id,
                    next_fire_at_ms: armed.fire_at_ms,
                });
                FireOutcome::Reloaded {
                    next_fire_at_ms: armed.fire_at_ms,
                }
            }
            None => {
                debug!(tab_id = %tab_id, "task stopped during reload; not re-arming");
                FireOutcome::Cancelled
            }
        }
    }

    fn delete(&self, tab_id: TabId, reason: DeleteReason) -> FireOutcome {
        let removed = {
            let mut state = self.lock();
            let removed = state.registry.remove(tab_id);
            self.inner.scheduler.disarm(tab_id);
            removed
        };
        let Some(task) = removed else {
            return FireOutcome::Cancelled;
        };

        info!(
            tab_id = %tab_id,
            url = %task.url,
            reason = reason.as_str(),
            "tab gone; task deleted"
        );
        self.emit(RefreshEvent::Deleted { tab_id, reason });
        FireOutcome::Deleted(reason)
    }

    async fn reopen(&self, tab_id: TabId, url: String) -> FireOutcome {
        // Remove-then-insert: the old id is free before the new tab exists.
        let removed = {
            let mut state = self.lock();
            let removed = state.registry.remove(tab_id);
            self.inner.scheduler.disarm(tab_id);
            removed
        };
        let Some(old) = removed else {
            info!(tab_id = %tab_id, "task stopped before reopen; skipping");
            return FireOutcome::Cancelled;
        };

        info!(tab_id = %tab_id, url = %url, "reopening closed tab");
        let created = match self.inner.tabs.create(&url, false).await {
            Ok(tab) => tab,
            Err(e) => {
                warn!(tab_id = %tab_id, url = %url, error = %e, "reopen failed; monitoring ends");
                self.emit(RefreshEvent::ReopenFailed {
                    tab_id,
                    url,
                    error: e.to_string(),
                });
                return FireOutcome::ReopenFailed;
            }
        };

        let new_tab_id = created.id;
        let mut fresh = old.rekeyed(new_tab_id, self.inner.scheduler.timer_prefix());
        fresh.url.clone_from(&url);

        let armed = {
            let mut state = self.lock();
            state.registry.upsert(new_tab_id, fresh);
            self.inner.scheduler.arm(&state.registry, new_tab_id)
        };
        if armed.is_none() {
            warn!(tab_id = %new_tab_id, "reopened task vanished before arming");
        }

        info!(old_tab_id = %tab_id, new_tab_id = %new_tab_id, url = %url, "tab reopened; monitoring moved");
        self.emit(RefreshEvent::Reopened {
            old_tab_id: tab_id,
            new_tab_id,
            url,
        });
        FireOutcome::Reopened { new_tab_id }
    }

    // -----------------------------------------------------------------------
    // Drivers
    // -----------------------------------------------------------------------

    /// Consume timer fires, handling each in its own task so a slow tab call
    /// only delays its own reconciliation.
    pub fn spawn_fire_loop(
        &self,
        mut fired_rx: mpsc::UnboundedReceiver<TimerFired>,
    ) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(fired) = fired_rx.recv().await {
                let service = service.clone();
                tokio::spawn(async move {
                    let outcome = service.handle_timer_fired(fired).await;
                    debug!(?outcome, "timer fire handled");
                });
            }
            debug!("timer channel closed; fire loop exiting");
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::scheduler::timer::{ManualClock, ManualTimerFacility};
    use crate::store::{KeyValueStore, MemoryStore};
    use crate::tabs::{LoadStatus, TabChange};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};
    use tokio::sync::Notify;

    /// Parks `get` until the test lets it continue.
    #[derive(Default)]
    struct GetGate {
        entered: Notify,
        release: Notify,
    }

    #[derive(Default)]
    struct ScriptedTabs {
        open: Mutex<HashMap<TabId, TabInfo>>,
        reloads: Mutex<Vec<TabId>>,
        created: Mutex<Vec<String>>,
        fail_create: AtomicBool,
        fail_reload: AtomicBool,
        get_gate: Mutex<Option<Arc<GetGate>>>,
        next_id: AtomicU64,
    }

    impl ScriptedTabs {
        fn new() -> Self {
            Self {
                next_id: AtomicU64::new(1000),
                ..Self::default()
            }
        }

        fn open_tab(&self, id: u64, url: &str) {
            self.open.lock().unwrap().insert(
                TabId(id),
                TabInfo {
                    id: TabId(id),
                    title: format!("Live {id}"),
                    url: url.to_owned(),
                    discarded: false,
                },
            );
        }

        fn close_tab(&self, id: u64) {
            self.open.lock().unwrap().remove(&TabId(id));
        }

        fn gate_get(&self) -> Arc<GetGate> {
            let gate = Arc::new(GetGate::default());
            *self.get_gate.lock().unwrap() = Some(Arc::clone(&gate));
            gate
        }
    }

    #[async_trait]
    impl TabDirectory for ScriptedTabs {
        async fn get(&self, tab_id: TabId) -> Result<TabInfo> {
            let gate = self.get_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            self.open
                .lock()
                .unwrap()
                .get(&tab_id)
                .cloned()
                .ok_or_else(|| RefreshError::Tab(format!("no tab with id {tab_id}")))
        }

        async fn reload(&self, tab_id: TabId) -> Result<()> {
            if self.fail_reload.load(Ordering::SeqCst) {
                return Err(RefreshError::Tab(format!("tab {tab_id} vanished mid-reload")));
            }
            self.reloads.lock().unwrap().push(tab_id);
            Ok(())
        }

        async fn create(&self, url: &str, _active: bool) -> Result<TabInfo> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(RefreshError::Tab("create refused".into()));
            }
            self.created.lock().unwrap().push(url.to_owned());
            let id = TabId(self.next_id.fetch_add(1, Ordering::SeqCst));
            Ok(TabInfo {
                id,
                title: String::new(),
                url: url.to_owned(),
                discarded: false,
            })
        }
    }

    struct Harness {
        service: RefreshService,
        tabs: Arc<ScriptedTabs>,
        timers: Arc<ManualTimerFacility>,
        clock: Arc<ManualClock>,
        kv: Arc<MemoryStore>,
    }

    fn harness(reopen: bool) -> Harness {
        let tabs = Arc::new(ScriptedTabs::new());
        let timers = Arc::new(ManualTimerFacility::new());
        let clock = Arc::new(ManualClock::new(50_000));
        let kv = Arc::new(MemoryStore::new());
        let deps = ServiceDeps {
            tabs: Arc::clone(&tabs) as Arc<dyn TabDirectory>,
            timers: Arc::clone(&timers) as Arc<dyn TimerFacility>,
            clock: Arc::clone(&clock) as Arc<dyn Clock>,
            settings: SettingsStore::new(Arc::clone(&kv) as Arc<dyn KeyValueStore>),
        };
        let service =
            RefreshService::with_reopen_setting(RefresherConfig::default(), deps, reopen);
        Harness {
            service,
            tabs,
            timers,
            clock,
            kv,
        }
    }

    fn start_req(id: u64, min: u64, max: u64, url: &str) -> StartRequest {
        StartRequest {
            tab_id: TabId(id),
            min_interval_secs: min,
            max_interval_secs: max,
            title: "X".to_owned(),
            url: url.to_owned(),
        }
    }

    #[tokio::test]
    async fn start_then_query_reports_intervals() {
        let h = harness(false);
        h.service.start(start_req(7, 5, 5, "https://x")).await.unwrap();

        let status = h.service.query_one(TabId(7)).unwrap();
        assert_eq!(status.min_interval_secs, 5);
        assert_eq!(status.max_interval_secs, 5);
        assert_eq!(status.title, "X");
        assert_eq!(status.time_left_ms, 5_000);
        assert!(!status.closed);
        assert!(status.status_note.is_none());
    }

    #[tokio::test]
    async fn start_rejects_inverted_interval() {
        let h = harness(false);
        let err = h.service.start(start_req(1, 10, 5, "https://x")).await.unwrap_err();
        assert!(matches!(err, RefreshError::InvalidInterval { .. }));
        assert!(h.service.query_one(TabId(1)).is_none());
        assert!(h.timers.pending_names().is_empty());
    }

    #[tokio::test]
    async fn start_fills_default_title_and_url() {
        let h = harness(false);
        let mut req = start_req(3, 1, 2, "");
        req.title = String::new();
        h.service.start(req).await.unwrap();

        let status = h.service.query_one(TabId(3)).unwrap();
        assert_eq!(status.title, "Tab 3");
        assert_eq!(status.url, "chrome://newtab/");
    }

    #[tokio::test]
    async fn start_persists_interval_prefs() {
        let h = harness(false);
        h.service.start(start_req(4, 30, 90, "https://x")).await.unwrap();
        assert_eq!(
            h.kv.get("tab_4_min").await.unwrap(),
            Some(serde_json::Value::from(30u64))
        );
        assert_eq!(h.service.interval_prefs(TabId(4)).await.unwrap(), (30, 90));
        assert_eq!(h.service.interval_prefs(TabId(5)).await.unwrap(), (60, 120));
    }

    #[tokio::test]
    async fn restart_replaces_timer() {
        let h = harness(false);
        h.service.start(start_req(2, 1, 1, "https://x")).await.unwrap();
        h.service.start(start_req(2, 9, 9, "https://x")).await.unwrap();
        assert_eq!(h.timers.pending_names(), vec!["refresh-tab-2".to_owned()]);
        assert_eq!(h.timers.scheduled_time("refresh-tab-2"), Some(59_000));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = harness(false);
        h.service.start(start_req(8, 1, 2, "https://x")).await.unwrap();
        assert!(h.service.stop(TabId(8)));
        assert!(!h.service.stop(TabId(8)));
        assert!(h.service.query_one(TabId(8)).is_none());
        assert!(h.timers.pending_names().is_empty());
    }

    #[tokio::test]
    async fn live_fire_reloads_and_rearms_exact_delay() {
        let h = harness(false);
        h.tabs.open_tab(7, "https://x");
        h.service.start(start_req(7, 5, 5, "https://x")).await.unwrap();

        h.clock.advance(5_000);
        let fired = h.timers.take_due(h.clock.now_ms());
        assert_eq!(fired.len(), 1);
        let outcome = h.service.handle_timer_fired(fired[0].clone()).await;

        assert_eq!(
            outcome,
            FireOutcome::Reloaded {
                next_fire_at_ms: 60_000
            }
        );
        assert_eq!(*h.tabs.reloads.lock().unwrap(), vec![TabId(7)]);
        assert_eq!(h.timers.scheduled_time("refresh-tab-7"), Some(60_000));
        assert_eq!(h.service.query_one(TabId(7)).unwrap().title, "Live 7");
    }

    #[tokio::test]
    async fn removal_defers_deletion_to_fire() {
        let h = harness(false);
        h.tabs.open_tab(9, "https://x");
        h.service.start(start_req(9, 1, 2, "https://x")).await.unwrap();

        h.tabs.close_tab(9);
        h.service.handle_tab_event(TabEvent::Removed { tab_id: TabId(9) });

        let status = h.service.query_one(TabId(9)).unwrap();
        assert!(status.closed);
        assert!(h.timers.scheduled_time("refresh-tab-9").is_some());

        let outcome = h.service.handle_fire(TabId(9)).await;
        assert_eq!(outcome, FireOutcome::Deleted(DeleteReason::ReopenDisabled));
        assert!(h.service.query_one(TabId(9)).is_none());
        assert!(h.tabs.created.lock().unwrap().is_empty());
        assert!(h.timers.pending_names().is_empty());
    }

    #[tokio::test]
    async fn reopen_rekeys_task() {
        let h = harness(true);
        h.tabs.open_tab(5, "https://example.com/a");
        let mut req = start_req(5, 1, 2, "https://example.com/a");
        req.title = "A".to_owned();
        h.service.start(req).await.unwrap();

        h.tabs.close_tab(5);
        h.service.handle_tab_event(TabEvent::Removed { tab_id: TabId(5) });
        let outcome = h.service.handle_fire(TabId(5)).await;

        assert_eq!(
            outcome,
            FireOutcome::Reopened {
                new_tab_id: TabId(1000)
            }
        );
        assert!(h.service.query_one(TabId(5)).is_none());
        let fresh = h.service.query_one(TabId(1000)).unwrap();
        assert_eq!(fresh.min_interval_secs, 1);
        assert_eq!(fresh.max_interval_secs, 2);
        assert_eq!(fresh.url, "https://example.com/a");
        assert_eq!(fresh.title, "A");
        assert!(!fresh.closed);
        assert_eq!(
            h.timers.pending_names(),
            vec!["refresh-tab-1000".to_owned()]
        );
    }

    #[tokio::test]
    async fn reopen_failure_leaves_task_deleted() {
        let h = harness(true);
        h.service.start(start_req(6, 1, 2, "https://x")).await.unwrap();
        h.tabs.fail_create.store(true, Ordering::SeqCst);

        let outcome = h.service.handle_fire(TabId(6)).await;
        assert_eq!(outcome, FireOutcome::ReopenFailed);
        assert!(h.service.query_all().is_empty());
        assert!(h.timers.pending_names().is_empty());
    }

    #[tokio::test]
    async fn placeholder_is_deleted_even_with_reopen() {
        let h = harness(true);
        h.service.start(start_req(11, 1, 2, "")).await.unwrap();
        h.service.handle_tab_event(TabEvent::Removed { tab_id: TabId(11) });

        let outcome = h.service.handle_fire(TabId(11)).await;
        assert_eq!(outcome, FireOutcome::Deleted(DeleteReason::PlaceholderUrl));
        assert!(h.tabs.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn discarded_tab_is_treated_as_gone() {
        let h = harness(false);
        h.tabs.open_tab(12, "https://x");
        h.tabs.open.lock().unwrap().get_mut(&TabId(12)).unwrap().discarded = true;
        h.service.start(start_req(12, 1, 2, "https://x")).await.unwrap();

        let outcome = h.service.handle_fire(TabId(12)).await;
        assert_eq!(outcome, FireOutcome::Deleted(DeleteReason::ReopenDisabled));
        assert!(h.tabs.reloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphan_fire_does_nothing() {
        let h = harness(true);
        let outcome = h
            .service
            .handle_timer_fired(TimerFired {
                name: "refresh-tab-77".to_owned(),
                scheduled_ms: 0,
            })
            .await;
        assert_eq!(outcome, FireOutcome::Orphan);
        assert!(h.service.query_all().is_empty());
        assert!(h.timers.pending_names().is_empty());
        assert!(h.tabs.created.lock().unwrap().is_empty());
    }

    /// Records whether the service lock was free whenever a timer is cleared.
    #[derive(Default)]
    struct LockCheckingTimers {
        timers: ManualTimerFacility,
        service: OnceLock<Weak<ServiceInner>>,
        clears: AtomicUsize,
        clears_outside_lock: AtomicUsize,
    }

    impl TimerFacility for LockCheckingTimers {
        fn create(&self, name: &str, when_ms: u64) {
            self.timers.create(name, when_ms);
        }

        fn clear(&self, name: &str) -> bool {
            self.clears.fetch_add(1, Ordering::SeqCst);
            if let Some(inner) = self.service.get().and_then(Weak::upgrade) {
                if inner.state.try_lock().is_ok() {
                    self.clears_outside_lock.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.timers.clear(name)
        }

        fn scheduled_time(&self, name: &str) -> Option<u64> {
            self.timers.scheduled_time(name)
        }
    }

    #[tokio::test]
    async fn orphan_disarm_happens_under_the_state_lock() {
        let timers = Arc::new(LockCheckingTimers::default());
        let deps = ServiceDeps {
            tabs: Arc::new(ScriptedTabs::new()),
            timers: Arc::clone(&timers) as Arc<dyn TimerFacility>,
            clock: Arc::new(ManualClock::new(0)),
            settings: SettingsStore::new(Arc::new(MemoryStore::new())),
        };
        let service = RefreshService::with_reopen_setting(RefresherConfig::default(), deps, false);
        timers.service.set(Arc::downgrade(&service.inner)).unwrap();

        service.start(start_req(30, 1, 2, "https://x")).await.unwrap();
        let outcome = service.handle_fire(TabId(31)).await;

        assert_eq!(outcome, FireOutcome::Orphan);
        assert!(timers.clears.load(Ordering::SeqCst) >= 1);
        assert_eq!(timers.clears_outside_lock.load(Ordering::SeqCst), 0);
        assert!(timers.scheduled_time("refresh-tab-30").is_some());
    }

    #[tokio::test]
    async fn reload_failure_without_reopen_deletes_task() {
        let h = harness(false);
        h.tabs.open_tab(40, "https://x");
        h.service.start(start_req(40, 1, 2, "https://x")).await.unwrap();
        h.tabs.fail_reload.store(true, Ordering::SeqCst);

        let outcome = h.service.handle_fire(TabId(40)).await;
        assert_eq!(outcome, FireOutcome::Deleted(DeleteReason::ReopenDisabled));
        assert!(h.service.query_one(TabId(40)).is_none());
        assert!(h.timers.pending_names().is_empty());
        assert!(h.tabs.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reload_failure_with_reopen_moves_task() {
        let h = harness(true);
        h.tabs.open_tab(41, "https://x/41");
        h.service.start(start_req(41, 1, 2, "https://x/41")).await.unwrap();
        h.tabs.fail_reload.store(true, Ordering::SeqCst);

        let outcome = h.service.handle_fire(TabId(41)).await;
        assert_eq!(
            outcome,
            FireOutcome::Reopened {
                new_tab_id: TabId(1000)
            }
        );
        assert_eq!(*h.tabs.created.lock().unwrap(), vec!["https://x/41".to_owned()]);
        assert_eq!(
            h.timers.pending_names(),
            vec!["refresh-tab-1000".to_owned()]
        );
    }

    #[tokio::test]
    async fn stop_during_tab_lookup_cancels_reopen() {
        let h = harness(true);
        h.service.start(start_req(42, 1, 2, "https://x")).await.unwrap();
        let gate = h.tabs.gate_get();

        let fire = {
            let service = h.service.clone();
            tokio::spawn(async move { service.handle_fire(TabId(42)).await })
        };
        gate.entered.notified().await;
        assert!(h.service.stop(TabId(42)));
        gate.release.notify_one();

        assert_eq!(fire.await.unwrap(), FireOutcome::Cancelled);
        assert!(h.tabs.created.lock().unwrap().is_empty());
        assert!(h.service.query_all().is_empty());
        assert!(h.timers.pending_names().is_empty());
    }

    #[tokio::test]
    async fn stop_during_tab_lookup_of_live_tab_skips_rearm() {
        let h = harness(false);
        h.tabs.open_tab(43, "https://x");
        h.service.start(start_req(43, 1, 2, "https://x")).await.unwrap();
        let gate = h.tabs.gate_get();

        let fire = {
            let service = h.service.clone();
            tokio::spawn(async move { service.handle_fire(TabId(43)).await })
        };
        gate.entered.notified().await;
        h.service.stop(TabId(43));
        gate.release.notify_one();

        assert_eq!(fire.await.unwrap(), FireOutcome::Cancelled);
        assert!(h.service.query_one(TabId(43)).is_none());
        assert!(h.timers.pending_names().is_empty());
    }

    #[tokio::test]
    async fn foreign_timer_is_ignored() {
        let h = harness(false);
        let outcome = h
            .service
            .handle_timer_fired(TimerFired {
                name: "backup-nightly".to_owned(),
                scheduled_ms: 0,
            })
            .await;
        assert_eq!(outcome, FireOutcome::Ignored);
    }

    #[tokio::test]
    async fn update_restores_closed_task() {
        let h = harness(false);
        h.tabs.open_tab(13, "https://x");
        h.service.start(start_req(13, 1, 2, "https://x")).await.unwrap();
        h.service.handle_tab_event(TabEvent::Removed { tab_id: TabId(13) });
        h.service.handle_tab_event(TabEvent::Updated {
            tab_id: TabId(13),
            change: TabChange {
                url: Some("https://x/next".to_owned()),
                status: Some(LoadStatus::Complete),
                ..TabChange::default()
            },
        });

        let status = h.service.query_one(TabId(13)).unwrap();
        assert!(!status.closed);
        assert_eq!(status.url, "https://x/next");

        let outcome = h.service.handle_fire(TabId(13)).await;
        assert!(matches!(outcome, FireOutcome::Reloaded { .. }));
    }

    #[tokio::test]
    async fn missing_timer_reports_rescheduling() {
        let h = harness(false);
        h.service.start(start_req(14, 1, 2, "https://x")).await.unwrap();
        h.timers.take("refresh-tab-14").unwrap();

        let status = h.service.query_one(TabId(14)).unwrap();
        assert_eq!(status.time_left_ms, 0);
        assert_eq!(status.status_note.as_deref(), Some(RESCHEDULING_NOTE));
    }

    #[tokio::test]
    async fn global_reopen_updates_memory_and_store() {
        let h = harness(false);
        assert!(!h.service.global_reopen());
        h.service.set_global_reopen(true).await.unwrap();
        assert!(h.service.global_reopen());
        assert_eq!(
            h.kv.get(crate::store::REOPEN_SETTING_KEY).await.unwrap(),
            Some(serde_json::Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn new_loads_reopen_setting_from_store() {
        let kv = Arc::new(MemoryStore::new());
        kv.set(crate::store::REOPEN_SETTING_KEY, serde_json::Value::Bool(true))
            .await
            .unwrap();
        let deps = ServiceDeps {
            tabs: Arc::new(ScriptedTabs::new()),
            timers: Arc::new(ManualTimerFacility::new()),
            clock: Arc::new(ManualClock::new(0)),
            settings: SettingsStore::new(kv),
        };
        let service = RefreshService::new(RefresherConfig::default(), deps)
            .await
            .unwrap();
        assert!(service.global_reopen());
    }

    #[tokio::test]
    async fn events_are_broadcast() {
        let h = harness(false);
        let mut rx = h.service.subscribe();
        h.service.start(start_req(15, 2, 2, "https://x")).await.unwrap();
        h.service.stop(TabId(15));

        assert!(matches!(
            rx.recv().await.unwrap(),
            RefreshEvent::Started { tab_id: TabId(15), next_fire_at_ms: 52_000, .. }
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            RefreshEvent::Stopped { tab_id: TabId(15) }
        );
    }
}
