//! Named one-shot timers.
//!
//! A [`TimerFacility`] keeps at most one pending entry per name. Each entry
//! fires once at or after its absolute deadline (epoch milliseconds) and is
//! delivered as a [`TimerFired`] to the single registered receiver.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

/// [`Clock`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        now_epoch_millis()
    }
}

/// Returns current UTC milliseconds since epoch.
#[must_use]
pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Manually advanced clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// A timer that reached its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    /// Timer name.
    pub name: String,
    /// Deadline the timer was created with (epoch ms).
    pub scheduled_ms: u64,
}

/// Named one-shot timer facility.
///
/// Operations are synchronous bookkeeping; firing is asynchronous.
pub trait TimerFacility: Send + Sync + 'static {
    /// Create `name` firing at `when_ms`, replacing any pending entry with that name.
    fn create(&self, name: &str, when_ms: u64);
    /// Cancel `name`. Returns `true` when an entry was pending.
    fn clear(&self, name: &str) -> bool;
    /// Deadline of the pending entry named `name`, if any.
    fn scheduled_time(&self, name: &str) -> Option<u64>;
}

struct TimerEntry {
    when_ms: u64,
    generation: u64,
    handle: JoinHandle<()>,
}

struct TimerShared {
    entries: Mutex<HashMap<String, TimerEntry>>,
    next_generation: AtomicU64,
    clock: Arc<dyn Clock>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
}

impl TimerShared {
    fn fire(&self, name: &str, generation: u64) {
        let fired = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get(name) {
                Some(entry) if entry.generation == generation => {
                    entries.remove(name).map(|entry| TimerFired {
                        name: name.to_owned(),
                        scheduled_ms: entry.when_ms,
                    })
                }
                _ => None,
            }
        };

        let Some(fired) = fired else {
            return;
        };
        if self.fired_tx.send(fired).is_err() {
            debug!(timer = name, "timer receiver dropped; fire discarded");
        }
    }
}

/// [`TimerFacility`] backed by tokio sleeps. Must be used inside a tokio runtime.
#[derive(Clone)]
pub struct TokioTimerFacility {
    shared: Arc<TimerShared>,
}

impl TokioTimerFacility {
    /// Create a facility delivering fires to `fired_tx`.
    pub fn new(clock: Arc<dyn Clock>, fired_tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            shared: Arc::new(TimerShared {
                entries: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                clock,
                fired_tx,
            }),
        }
    }

    /// Create a facility plus the receiver its fires are delivered to.
    pub fn with_channel(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(clock, tx), rx)
    }

    /// Cancel every pending timer.
    pub fn clear_all(&self) {
        let mut entries = self.shared.entries.lock().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in entries.drain() {
            entry.handle.abort();
        }
    }

    /// Number of pending timers.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl TimerFacility for TokioTimerFacility {
    fn create(&self, name: &str, when_ms: u64) {
        let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let delay_ms = when_ms.saturating_sub(self.shared.clock.now_ms());

        // Held across spawn + insert so the sleeper cannot observe a missing entry.
        let mut entries = self.shared.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = entries.remove(name) {
            previous.handle.abort();
        }

        let shared = Arc::clone(&self.shared);
        let owned_name = name.to_owned();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            shared.fire(&owned_name, generation);
        });

        entries.insert(
            name.to_owned(),
            TimerEntry {
                when_ms,
                generation,
                handle,
            },
        );
    }

    fn clear(&self, name: &str) -> bool {
        let mut entries = self.shared.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.remove(name) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    fn scheduled_time(&self, name: &str) -> Option<u64> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|entry| entry.when_ms)
    }
}

/// [`TimerFacility`] whose entries only fire when the owner asks.
///
/// Useful when the host environment owns the real alarms, and in tests.
#[derive(Debug, Default)]
pub struct ManualTimerFacility {
    entries: Mutex<BTreeMap<String, u64>>,
}

impl ManualTimerFacility {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every entry due at `now_ms`, earliest first.
    pub fn take_due(&self, now_ms: u64) -> Vec<TimerFired> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let due: Vec<String> = entries
            .iter()
            .filter(|(_, when)| **when <= now_ms)
            .map(|(name, _)| name.clone())
            .collect();

        let mut fired: Vec<TimerFired> = due
            .into_iter()
            .filter_map(|name| {
                entries.remove(&name).map(|scheduled_ms| TimerFired { name, scheduled_ms })
            })
            .collect();
        fired.sort_by_key(|f| f.scheduled_ms);
        fired
    }

    /// Remove and return the named entry regardless of its deadline.
    pub fn take(&self, name: &str) -> Option<TimerFired> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .map(|scheduled_ms| TimerFired {
                name: name.to_owned(),
                scheduled_ms,
            })
    }

    /// Names of all pending entries.
    #[must_use]
    pub fn pending_names(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl TimerFacility for ManualTimerFacility {
    fn create(&self, name: &str, when_ms: u64) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_owned(), when_ms);
    }

    fn clear(&self, name: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some()
    }

    fn scheduled_time(&self, name: &str) -> Option<u64> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }
}
