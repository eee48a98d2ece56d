//! Shared sweep scheduler: weak membership tracking plus one lazily
//! started, self-stopping timer thread.
//!
//! Queues register at construction and unregister at close or drop. The
//! scheduler holds only [`Weak`] references, so membership never keeps a
//! queue alive; an owner that drops its handle without closing is forgotten
//! on the next pass. The timer thread starts with the first live
//! registration, fires at a fixed period, and stops itself when a pass
//! finds no live members left.
//!
//! Locking discipline: the member list lock ranks above every queue lock,
//! and a pass upgrades its targets and releases the list before calling
//! into any of them. A queue closing itself from under the timer therefore
//! never deadlocks against an in-flight pass.

use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::config::SweepConfig;
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::record::now_millis;

// ---------------------------------------------------------------------------
// Sweep target contract
// ---------------------------------------------------------------------------

/// Something the scheduler can periodically ask to reclaim expired state.
pub trait Sweepable: Send + Sync {
    /// Run one reclamation step as of `now_millis` and report what changed.
    fn sweep(&self, now_millis: i64) -> SweepOutcome;
}

/// Result of one sweep call against one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepOutcome {
    /// Records held before the sweep.
    pub before: usize,
    /// Records held after the sweep.
    pub after: usize,
    /// Records reclaimed by this call.
    pub evicted: usize,
}

/// Opaque handle returned by [`SweepScheduler::register`].
///
/// Each call yields a distinct handle; unregistering one handle never
/// affects another, so two registrations of the same target are simply
/// swept twice until one is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

// ---------------------------------------------------------------------------
// Timer control
// ---------------------------------------------------------------------------

/// Stop flag with a condvar so a parked timer thread wakes immediately.
///
/// Leaf lock: never held while acquiring any ordered lock.
struct TimerControl {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl TimerControl {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn request_stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *stopped = true;
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Sleep up to `timeout`, returning early if stop is requested.
    /// Returns `true` when stopped.
    fn wait_stop(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timed_out) = self
                .wake
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            stopped = guard;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct MemberEntry {
    id: u64,
    target: Weak<dyn Sweepable>,
}

struct SchedulerInner {
    next_id: u64,
    members: Vec<MemberEntry>,
    /// Control block of the currently running timer generation, if any.
    timer: Option<Arc<TimerControl>>,
}

/// Cumulative counters, readable without touching the member lock.
#[derive(Debug, Default)]
struct Counters {
    passes: AtomicU64,
    members_swept: AtomicU64,
    records_evicted: AtomicU64,
    dead_purged: AtomicU64,
}

/// Point-in-time view of the scheduler's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepStatsSnapshot {
    /// Completed timer passes.
    pub passes: u64,
    /// Live members visited across all passes.
    pub members_swept: u64,
    /// Records reclaimed across all passes.
    pub records_evicted: u64,
    /// Dead weak entries dropped from the member list.
    pub dead_purged: u64,
}

/// Fixed-rate sweeper shared by every queue registered with it.
///
/// Usually obtained through [`SweepScheduler::shared`], but any number of
/// independently configured instances can coexist (tests rely on this).
pub struct SweepScheduler {
    config: SweepConfig,
    inner: OrderedMutex<SchedulerInner>,
    counters: Counters,
    self_weak: Weak<Self>,
}

impl SweepScheduler {
    /// Create an independent scheduler. The timer does not start until the
    /// first live registration arrives.
    #[must_use]
    pub fn new(config: SweepConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            config,
            inner: OrderedMutex::new(
                LockLevel::SchedulerMembers,
                SchedulerInner {
                    next_id: 0,
                    members: Vec::new(),
                    timer: None,
                },
            ),
            counters: Counters::default(),
            self_weak: self_weak.clone(),
        })
    }

    /// Process-wide scheduler with default timing, created on first use.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<SweepScheduler>> = OnceLock::new();
        Arc::clone(SHARED.get_or_init(|| Self::new(SweepConfig::default())))
    }

    /// Timing parameters this scheduler runs with.
    #[must_use]
    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Add a member and start the timer if the live count is now non-zero.
    ///
    /// Dead entries are purged on the way in, so a long-idle scheduler does
    /// not accumulate garbage between passes. Generic over the concrete
    /// target so callers hand in `Arc::downgrade(&x)` directly; the unsizing
    /// happens here.
    pub fn register<S: Sweepable + 'static>(&self, target: Weak<S>) -> RegistrationId {
        let target: Weak<dyn Sweepable> = target;
        let mut inner = self.inner.lock();
        self.purge_dead_locked(&mut inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.members.push(MemberEntry { id, target });
        let any_live = inner
            .members
            .iter()
            .any(|m| m.target.strong_count() > 0);
        if any_live && inner.timer.is_none() {
            self.start_timer_locked(&mut inner);
        }
        RegistrationId(id)
    }

    /// Remove the member behind `id`. Unknown or already-removed handles
    /// are a no-op. Stops the timer when the last live member leaves.
    pub fn unregister(&self, id: RegistrationId) {
        let mut inner = self.inner.lock();
        inner.members.retain(|m| m.id != id.0);
        self.purge_dead_locked(&mut inner);
        if inner.members.is_empty() && inner.timer.is_some() {
            Self::stop_timer_locked(&mut inner);
        }
    }

    /// Whether the timer thread is currently scheduled to run.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.lock().timer.is_some()
    }

    /// Registered entries whose target is still alive.
    #[must_use]
    pub fn live_members(&self) -> usize {
        self.inner
            .lock()
            .members
            .iter()
            .filter(|m| m.target.strong_count() > 0)
            .count()
    }

    /// Stop the timer now, keeping all registrations. The next `register`
    /// of a live member restarts it.
    pub fn force_stop(&self) {
        let mut inner = self.inner.lock();
        if inner.timer.is_some() {
            Self::stop_timer_locked(&mut inner);
        }
    }

    /// Cumulative pass counters.
    #[must_use]
    pub fn stats(&self) -> SweepStatsSnapshot {
        SweepStatsSnapshot {
            passes: self.counters.passes.load(Ordering::Relaxed),
            members_swept: self.counters.members_swept.load(Ordering::Relaxed),
            records_evicted: self.counters.records_evicted.load(Ordering::Relaxed),
            dead_purged: self.counters.dead_purged.load(Ordering::Relaxed),
        }
    }

    fn purge_dead_locked(&self, inner: &mut SchedulerInner) {
        let before = inner.members.len();
        inner.members.retain(|m| m.target.strong_count() > 0);
        let purged = (before - inner.members.len()) as u64;
        if purged > 0 {
            self.counters.dead_purged.fetch_add(purged, Ordering::Relaxed);
            tracing::debug!("[sweep] purged {purged} dead member(s)");
        }
    }

    fn start_timer_locked(&self, inner: &mut SchedulerInner) {
        let ctrl = Arc::new(TimerControl::new());
        let thread_ctrl = Arc::clone(&ctrl);
        let scheduler = self.self_weak.clone();
        let initial_delay = self.config.initial_delay;
        let period = self.config.period;
        std::thread::Builder::new()
            .name("tokentrail-sweep".into())
            .spawn(move || timer_loop(&scheduler, &thread_ctrl, initial_delay, period))
            .expect("failed to spawn sweep timer thread");
        inner.timer = Some(ctrl);
        tracing::debug!(
            "[sweep] timer started (initial_delay={initial_delay:?}, period={period:?})"
        );
    }

    fn stop_timer_locked(inner: &mut SchedulerInner) {
        if let Some(ctrl) = inner.timer.take() {
            ctrl.request_stop();
            tracing::debug!("[sweep] timer stopped");
        }
    }

    /// One timer tick. Returns `false` when the loop should exit, either
    /// because this generation was superseded or because no live members
    /// remain and the timer shut itself down.
    fn run_pass(&self, ctrl: &Arc<TimerControl>) -> bool {
        let targets: Vec<Arc<dyn Sweepable>> = {
            let mut inner = self.inner.lock();
            // A force_stop/restart race can leave an old generation ticking
            // once more; only the current generation may act.
            let current = inner.timer.as_ref().is_some_and(|t| Arc::ptr_eq(t, ctrl));
            if !current {
                return false;
            }
            self.purge_dead_locked(&mut inner);
            if inner.members.is_empty() {
                // Last owner vanished without unregistering; shut down.
                Self::stop_timer_locked(&mut inner);
                return false;
            }
            inner.members.iter().filter_map(|m| m.target.upgrade()).collect()
        };
        // Member list released: sweeping takes per-queue locks and must not
        // hold the list across them.
        let now = now_millis();
        let mut swept = 0u64;
        let mut evicted = 0usize;
        for target in &targets {
            // One misbehaving member (e.g. panicking mid-teardown) must not
            // take down the timer thread or starve the remaining members.
            match panic::catch_unwind(panic::AssertUnwindSafe(|| target.sweep(now))) {
                Ok(outcome) => {
                    swept += 1;
                    evicted += outcome.evicted;
                }
                Err(_) => {
                    tracing::warn!("[sweep] member panicked during sweep; skipping it");
                }
            }
        }
        self.counters.passes.fetch_add(1, Ordering::Relaxed);
        self.counters.members_swept.fetch_add(swept, Ordering::Relaxed);
        self.counters
            .records_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        if evicted > 0 {
            tracing::debug!(
                "[sweep] pass complete: members={} evicted={evicted}",
                targets.len()
            );
        }
        true
    }
}

impl std::fmt::Debug for SweepScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepScheduler")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn timer_loop(
    scheduler: &Weak<SweepScheduler>,
    ctrl: &Arc<TimerControl>,
    initial_delay: Duration,
    period: Duration,
) {
    if ctrl.wait_stop(initial_delay) {
        return;
    }
    loop {
        let Some(scheduler) = scheduler.upgrade() else {
            // Scheduler itself dropped; nothing left to sweep.
            return;
        };
        let keep_going = scheduler.run_pass(ctrl);
        drop(scheduler);
        if !keep_going || ctrl.wait_stop(period) {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
