//! Capacity-bounded, cooldown-gated FIFO of issued tokens.
//!
//! Each [`BoundedTokenQueue`] is owned by one logical caller and guarded by
//! its own lock; many queues mutate fully in parallel. Readers never block:
//! every mutation publishes an immutable newest-first snapshot through an
//! atomic reference swap, so [`BoundedTokenQueue::snapshot`] returns the
//! previous consistent state while a mutation is in flight, never a torn
//! read.
//!
//! Mutations trigger a best-effort persistence save through the
//! [`TokenStore`] gateway. The record lock is held only for in-memory list
//! manipulation plus staging the save; the write itself runs behind a
//! per-queue save gate that keeps saves in mutation order without blocking
//! admissions behind slow IO.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::HistoryConfig;
use crate::error::Result;
use crate::lock_order::{LockLevel, OrderedMutex};
use crate::record::{TokenRecord, now_millis};
use crate::registry::{RegistrationId, SweepOutcome, SweepScheduler, Sweepable};
use crate::store::TokenStore;

// ---------------------------------------------------------------------------
// Shared inner state
// ---------------------------------------------------------------------------

/// State shared between the owning handle and the sweep scheduler.
///
/// The scheduler tracks this through a `Weak`, so membership never extends
/// the queue's lifetime: when the owner drops the handle, the next sweep
/// pass forgets the entry.
pub(crate) struct QueueShared {
    config: HistoryConfig,
    /// Oldest-first record deque. The single mutation lock.
    records: OrderedMutex<VecDeque<TokenRecord>>,
    /// Newest-first copy published after every mutation. Lock-free reads.
    snapshot: ArcSwap<Vec<TokenRecord>>,
    store: Option<Arc<dyn TokenStore>>,
    /// Monotonic mutation sequence used to keep saves in order.
    save_seq: AtomicU64,
    /// Highest sequence already handed to the store. Serializes saves.
    save_gate: OrderedMutex<u64>,
}

/// Save work staged under the record lock, executed after releasing it.
type StagedSave = Option<(u64, Vec<TokenRecord>)>;

impl QueueShared {
    fn new(config: HistoryConfig, store: Option<Arc<dyn TokenStore>>) -> Self {
        Self {
            config,
            records: OrderedMutex::new(LockLevel::QueueRecords, VecDeque::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            store,
            save_seq: AtomicU64::new(0),
            save_gate: OrderedMutex::new(LockLevel::QueueSaveGate, 0),
        }
    }

    /// Publish a fresh newest-first snapshot. Caller holds the record lock.
    fn publish_locked(&self, records: &VecDeque<TokenRecord>) {
        let newest_first: Vec<TokenRecord> = records.iter().rev().cloned().collect();
        self.snapshot.store(Arc::new(newest_first));
    }

    /// Stage a save of the full contents. Caller holds the record lock.
    fn stage_save_locked(&self, records: &VecDeque<TokenRecord>) -> StagedSave {
        self.store.as_ref()?;
        let seq = self.save_seq.fetch_add(1, Ordering::Relaxed) + 1;
        Some((seq, records.iter().cloned().collect()))
    }

    /// Hand staged contents to the store, best-effort.
    ///
    /// The save gate enforces mutation order: a staged save that has been
    /// overtaken by a newer one is dropped rather than written stale, and
    /// writes for the same queue never interleave.
    fn persist(&self, staged: StagedSave) {
        let Some((seq, contents)) = staged else {
            return;
        };
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let mut last = self.save_gate.lock();
        if seq <= *last {
            return;
        }
        *last = seq;
        if let Err(e) = store.save(&contents) {
            tracing::warn!("[queue] save failed, in-memory state unaffected: {e}");
        }
    }

    fn admit_at(&self, token: String, now_millis: i64) -> bool {
        let staged = {
            let mut records = self.records.lock();
            let gate_open = records
                .back()
                .is_none_or(|newest| newest.age_millis(now_millis) >= self.config.cool_time_millis());
            if !gate_open {
                return false;
            }
            // Capacity pressure always wins: the displaced record is dropped
            // regardless of retain_tail or ttl.
            if records.len() == self.config.capacity {
                if let Some(dropped) = records.pop_front() {
                    tracing::trace!("[queue] displaced oldest token {:?}", dropped.token);
                }
            }
            records.push_back(TokenRecord::new(token, now_millis));
            self.publish_locked(&records);
            self.stage_save_locked(&records)
        };
        self.persist(staged);
        true
    }

    fn evict_at(&self, now_millis: i64) -> (usize, Vec<TokenRecord>) {
        let ttl_millis = self.config.ttl_millis();
        let (before, removed, staged) = {
            let mut records = self.records.lock();
            let before = records.len();
            let mut removed = Vec::new();
            while records.len() > self.config.retain_tail {
                let expired = records
                    .front()
                    .is_some_and(|oldest| oldest.age_millis(now_millis) > ttl_millis);
                if !expired {
                    break;
                }
                if let Some(rec) = records.pop_front() {
                    removed.push(rec);
                }
            }
            if removed.is_empty() {
                // Nothing to do: skip snapshot churn and needless IO.
                (before, removed, None)
            } else {
                self.publish_locked(&records);
                let staged = self.stage_save_locked(&records);
                (before, removed, staged)
            }
        };
        self.persist(staged);
        (before, removed)
    }

    fn load_initial(&self, records: Vec<TokenRecord>) {
        let mut deque: VecDeque<TokenRecord> = records.into();
        if deque.len() > self.config.capacity {
            // Keep the tail: the newest `capacity` records.
            let excess = deque.len() - self.config.capacity;
            deque.drain(..excess);
        }
        let mut guard = self.records.lock();
        *guard = deque;
        self.publish_locked(&guard);
        // No save: the data was just read from the same store.
    }

    fn len(&self) -> usize {
        self.records.lock().len()
    }

    fn newest(&self) -> Option<TokenRecord> {
        self.records.lock().back().cloned()
    }

    fn is_admissible_at(&self, now_millis: i64) -> bool {
        let records = self.records.lock();
        if records.len() == self.config.capacity {
            return false;
        }
        records
            .back()
            .is_none_or(|newest| newest.age_millis(now_millis) >= self.config.cool_time_millis())
    }
}

impl Sweepable for QueueShared {
    fn sweep(&self, now_millis: i64) -> SweepOutcome {
        let (before, removed) = self.evict_at(now_millis);
        SweepOutcome {
            before,
            after: before - removed.len(),
            evicted: removed.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// Owner handle
// ---------------------------------------------------------------------------

/// A capacity-bounded, cooldown-gated FIFO of [`TokenRecord`]s.
///
/// Created by its owner, registered with the injected [`SweepScheduler`] at
/// construction, and unregistered at [`close`](Self::close) or drop. The
/// scheduler's shared timer drives periodic [`evict`](Self::evict) calls;
/// owner threads and the timer contend only on this queue's own lock.
pub struct BoundedTokenQueue {
    shared: Arc<QueueShared>,
    scheduler: Arc<SweepScheduler>,
    registration: OrderedMutex<Option<RegistrationId>>,
}

impl BoundedTokenQueue {
    /// Create a queue with no persistence.
    pub fn new(config: HistoryConfig, scheduler: Arc<SweepScheduler>) -> Result<Self> {
        Self::build(config, scheduler, None)
    }

    /// Create a queue that saves its contents through `store` after every
    /// mutation.
    pub fn with_store(
        config: HistoryConfig,
        scheduler: Arc<SweepScheduler>,
        store: Arc<dyn TokenStore>,
    ) -> Result<Self> {
        Self::build(config, scheduler, Some(store))
    }

    fn build(
        config: HistoryConfig,
        scheduler: Arc<SweepScheduler>,
        store: Option<Arc<dyn TokenStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(QueueShared::new(config, store));
        let id = scheduler.register(Arc::downgrade(&shared));
        Ok(Self {
            shared,
            scheduler,
            registration: OrderedMutex::new(LockLevel::QueueRegistration, Some(id)),
        })
    }

    /// Admission parameters this queue was built with.
    #[must_use]
    pub fn config(&self) -> &HistoryConfig {
        &self.shared.config
    }

    /// Try to admit `token` at the current wall-clock time.
    pub fn admit(&self, token: impl Into<String>) -> bool {
        self.admit_at(token, now_millis())
    }

    /// Try to admit `token` as of `now_millis`.
    ///
    /// Returns `true` and appends a record when the queue is empty or the
    /// newest record is at least `cool_time` old; otherwise returns `false`
    /// with no mutation. A full queue drops its oldest record first, so
    /// admission never fails solely due to fullness.
    pub fn admit_at(&self, token: impl Into<String>, now_millis: i64) -> bool {
        self.shared.admit_at(token.into(), now_millis)
    }

    /// Evict expired records as of the current wall-clock time.
    pub fn evict(&self) -> Vec<TokenRecord> {
        self.evict_at(now_millis())
    }

    /// Evict from the oldest end while the queue holds more than
    /// `retain_tail` records and the oldest is older than `ttl`.
    ///
    /// Returns the removed records, oldest-first; an empty result means
    /// nothing was eligible (and no save is triggered).
    pub fn evict_at(&self, now_millis: i64) -> Vec<TokenRecord> {
        self.shared.evict_at(now_millis).1
    }

    /// Number of records currently held. Always `<= capacity`.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Whether the queue holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue is at capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() == self.shared.config.capacity
    }

    /// The most recently admitted record, if any.
    #[must_use]
    pub fn newest(&self) -> Option<TokenRecord> {
        self.shared.newest()
    }

    /// Whether an insertion at `now_millis` would be accepted without
    /// displacing an existing record: not full and cool time elapsed.
    #[must_use]
    pub fn is_admissible_at(&self, now_millis: i64) -> bool {
        self.shared.is_admissible_at(now_millis)
    }

    /// [`is_admissible_at`](Self::is_admissible_at) at wall-clock now.
    #[must_use]
    pub fn is_admissible(&self) -> bool {
        self.is_admissible_at(now_millis())
    }

    /// The last published snapshot, newest-first.
    ///
    /// O(1), never blocks on an in-progress mutation: an ongoing `admit` or
    /// `evict` publishes its snapshot only once committed.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<TokenRecord>> {
        self.shared.snapshot.load_full()
    }

    /// Replace current contents with `records` (oldest-first, newest last),
    /// truncating to the newest `capacity` records.
    ///
    /// Used once at startup by the persistence loader. Publishes a snapshot
    /// but does not trigger a save — the data was just read from the store.
    pub fn load_initial(&self, records: Vec<TokenRecord>) {
        self.shared.load_initial(records);
    }

    /// Load persisted contents from the configured store and install them
    /// via [`load_initial`](Self::load_initial).
    ///
    /// Returns the number of records installed. Queues without a store
    /// hydrate to nothing. Unlike saves, load failures propagate: the owner
    /// decides what an unreadable store at startup means.
    pub fn hydrate(&self) -> Result<usize> {
        let Some(store) = self.shared.store.as_ref() else {
            return Ok(0);
        };
        let records = store.load()?;
        let installed = records.len().min(self.shared.config.capacity);
        self.load_initial(records);
        Ok(installed)
    }

    /// Unregister from the sweep scheduler. Idempotent; also runs on drop.
    ///
    /// The queue remains usable in-memory afterwards, it just stops being
    /// swept.
    pub fn close(&self) {
        let id = self.registration.lock().take();
        if let Some(id) = id {
            self.scheduler.unregister(id);
        }
    }
}

impl Drop for BoundedTokenQueue {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BoundedTokenQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedTokenQueue")
            .field("config", &self.shared.config)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SweepConfig;
    use crate::error::Error;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Store that records every save and serves a canned load.
    #[derive(Default)]
    struct RecordingStore {
        saves: Mutex<Vec<Vec<TokenRecord>>>,
        canned: Mutex<Vec<TokenRecord>>,
    }

    impl RecordingStore {
        fn save_count(&self) -> usize {
            self.saves.lock().unwrap().len()
        }

        fn last_save(&self) -> Option<Vec<TokenRecord>> {
            self.saves.lock().unwrap().last().cloned()
        }
    }

    impl TokenStore for RecordingStore {
        fn save(&self, records: &[TokenRecord]) -> Result<()> {
            self.saves.lock().unwrap().push(records.to_vec());
            Ok(())
        }

        fn load(&self) -> Result<Vec<TokenRecord>> {
            Ok(self.canned.lock().unwrap().clone())
        }

        fn exists(&self) -> bool {
            !self.canned.lock().unwrap().is_empty()
        }

        fn delete(&self) -> Result<bool> {
            Ok(false)
        }
    }

    /// Store whose saves always fail.
    struct FailingStore;

    impl TokenStore for FailingStore {
        fn save(&self, _records: &[TokenRecord]) -> Result<()> {
            Err(Error::Io(std::io::Error::other("disk on fire")))
        }

        fn load(&self) -> Result<Vec<TokenRecord>> {
            Err(Error::Io(std::io::Error::other("disk on fire")))
        }

        fn exists(&self) -> bool {
            false
        }

        fn delete(&self) -> Result<bool> {
            Ok(false)
        }
    }

    fn idle_scheduler() -> Arc<SweepScheduler> {
        // Long initial delay so no pass fires during a unit test.
        SweepScheduler::new(
            SweepConfig::new(Duration::from_secs(3600), Duration::from_secs(3600)).unwrap(),
        )
    }

    fn config(capacity: usize, cool_ms: u64, retain_tail: usize, ttl_ms: u64) -> HistoryConfig {
        HistoryConfig::new(
            capacity,
            Duration::from_millis(cool_ms),
            retain_tail,
            Duration::from_millis(ttl_ms),
        )
        .unwrap()
    }

    fn tokens(queue: &BoundedTokenQueue) -> Vec<String> {
        // Oldest-first view derived from the newest-first snapshot.
        let mut v: Vec<String> = queue.snapshot().iter().map(|r| r.token.clone()).collect();
        v.reverse();
        v
    }

    #[test]
    fn basic_admission_scenario() {
        let queue =
            BoundedTokenQueue::new(config(10, 1000, 1, 60_000), idle_scheduler()).unwrap();
        let t0 = 1_700_000_000_000;

        assert!(queue.admit_at("a", t0));
        assert_eq!(queue.len(), 1);

        assert!(!queue.admit_at("b", t0 + 500));
        assert_eq!(queue.len(), 1);

        assert!(queue.admit_at("b", t0 + 1001));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.newest().unwrap().token, "b");
    }

    #[test]
    fn cool_time_boundary_is_inclusive() {
        let queue =
            BoundedTokenQueue::new(config(10, 1000, 1, 60_000), idle_scheduler()).unwrap();
        assert!(queue.admit_at("a", 5_000));
        // Exactly cool_time later: accepted.
        assert!(queue.admit_at("b", 6_000));
    }

    #[test]
    fn zero_cool_time_accepts_same_timestamp() {
        let queue = BoundedTokenQueue::new(config(4, 0, 1, 60_000), idle_scheduler()).unwrap();
        assert!(queue.admit_at("a", 1_000));
        assert!(queue.admit_at("b", 1_000));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn overflow_replaces_exactly_the_oldest() {
        let queue = BoundedTokenQueue::new(config(3, 0, 1, 60_000), idle_scheduler()).unwrap();
        for (i, t) in ["a", "b", "c"].iter().enumerate() {
            assert!(queue.admit_at(*t, 1_000 + i as i64));
        }
        assert!(queue.is_full());

        assert!(queue.admit_at("d", 2_000));
        assert_eq!(queue.len(), 3);
        assert_eq!(tokens(&queue), ["b", "c", "d"]);
    }

    #[test]
    fn overflow_ignores_retain_tail_and_ttl() {
        // All records fresh (well inside ttl) and retain_tail pins two, yet
        // capacity pressure still drops the oldest.
        let queue = BoundedTokenQueue::new(config(3, 0, 2, 60_000), idle_scheduler()).unwrap();
        for t in ["a", "b", "c"] {
            assert!(queue.admit_at(t, 1_000));
        }
        assert!(queue.admit_at("d", 1_000));
        assert_eq!(tokens(&queue), ["b", "c", "d"]);
    }

    #[test]
    fn capacity_invariant_holds_across_many_admits() {
        let queue = BoundedTokenQueue::new(config(5, 0, 1, 60_000), idle_scheduler()).unwrap();
        for i in 0..100 {
            queue.admit_at(format!("t{i}"), i);
            assert!(queue.len() <= 5);
        }
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn eviction_respects_retain_tail_floor() {
        let queue = BoundedTokenQueue::new(config(10, 0, 1, 60_000), idle_scheduler()).unwrap();
        let t0 = 1_000_000;
        for t in ["a", "b", "c"] {
            assert!(queue.admit_at(t, t0));
        }
        // All three are far older than ttl.
        let removed = queue.evict_at(t0 + 120_000);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].token, "a");
        assert_eq!(removed[1].token, "b");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.newest().unwrap().token, "c");
    }

    #[test]
    fn eviction_stops_at_first_record_within_ttl() {
        let queue = BoundedTokenQueue::new(config(10, 0, 0, 1_000), idle_scheduler()).unwrap();
        assert!(queue.admit_at("old1", 1_000));
        assert!(queue.admit_at("old2", 1_100));
        assert!(queue.admit_at("fresh", 9_800));
        // old1/old2 expired, fresh is inside ttl; no skipping past it.
        let removed = queue.evict_at(10_000);
        assert_eq!(removed.len(), 2);
        assert_eq!(tokens(&queue), ["fresh"]);
    }

    #[test]
    fn eviction_ttl_boundary_is_exclusive() {
        let queue = BoundedTokenQueue::new(config(10, 0, 0, 1_000), idle_scheduler()).unwrap();
        assert!(queue.admit_at("a", 1_000));
        // Age exactly ttl: not strictly older, stays.
        assert!(queue.evict_at(2_000).is_empty());
        // One millisecond past: removed.
        assert_eq!(queue.evict_at(2_001).len(), 1);
    }

    #[test]
    fn evict_on_empty_queue_is_a_noop() {
        let store = Arc::new(RecordingStore::default());
        let queue = BoundedTokenQueue::with_store(
            config(4, 0, 0, 1_000),
            idle_scheduler(),
            store.clone(),
        )
        .unwrap();
        assert!(queue.evict_at(i64::MAX).is_empty());
        assert_eq!(store.save_count(), 0, "no-op eviction must not save");
    }

    #[test]
    fn snapshot_is_newest_first_and_stable() {
        let queue = BoundedTokenQueue::new(config(4, 0, 1, 60_000), idle_scheduler()).unwrap();
        assert!(queue.admit_at("a", 1));
        assert!(queue.admit_at("b", 2));

        let before = queue.snapshot();
        assert_eq!(before[0].token, "b");
        assert_eq!(before[1].token, "a");

        assert!(queue.admit_at("c", 3));
        // The previously obtained snapshot is immutable.
        assert_eq!(before.len(), 2);
        let after = queue.snapshot();
        assert_eq!(after[0].token, "c");
        assert_eq!(after.len(), 3);
    }

    #[test]
    fn snapshot_of_new_queue_is_empty() {
        let queue = BoundedTokenQueue::new(config(4, 0, 1, 60_000), idle_scheduler()).unwrap();
        assert!(queue.snapshot().is_empty());
    }

    #[test]
    fn is_admissible_requires_room_and_cool_time() {
        let queue = BoundedTokenQueue::new(config(2, 1000, 1, 60_000), idle_scheduler()).unwrap();
        assert!(queue.is_admissible_at(0));

        assert!(queue.admit_at("a", 1_000));
        assert!(!queue.is_admissible_at(1_500), "cool time not elapsed");
        assert!(queue.is_admissible_at(2_000));

        assert!(queue.admit_at("b", 2_000));
        // Full: not admissible even though admit would displace and succeed.
        assert!(!queue.is_admissible_at(10_000));
        assert!(queue.admit_at("c", 10_000));
    }

    #[test]
    fn load_initial_truncates_keeping_newest() {
        let queue = BoundedTokenQueue::new(config(3, 0, 1, 60_000), idle_scheduler()).unwrap();
        let records: Vec<TokenRecord> = (0..5)
            .map(|i| TokenRecord::new(format!("t{i}"), i))
            .collect();
        queue.load_initial(records);
        assert_eq!(queue.len(), 3);
        assert_eq!(tokens(&queue), ["t2", "t3", "t4"]);
    }

    #[test]
    fn load_initial_does_not_save() {
        let store = Arc::new(RecordingStore::default());
        let queue = BoundedTokenQueue::with_store(
            config(4, 0, 1, 60_000),
            idle_scheduler(),
            store.clone(),
        )
        .unwrap();
        queue.load_initial(vec![TokenRecord::new("t", 1)]);
        assert_eq!(queue.len(), 1);
        assert_eq!(store.save_count(), 0);
    }

    #[test]
    fn load_initial_replaces_existing_contents() {
        let queue = BoundedTokenQueue::new(config(4, 0, 1, 60_000), idle_scheduler()).unwrap();
        assert!(queue.admit_at("stale", 1));
        queue.load_initial(vec![TokenRecord::new("fresh", 2)]);
        assert_eq!(tokens(&queue), ["fresh"]);
    }

    #[test]
    fn hydrate_installs_store_contents() {
        let store = Arc::new(RecordingStore::default());
        *store.canned.lock().unwrap() = vec![
            TokenRecord::new("a", 1),
            TokenRecord::new("b", 2),
        ];
        let queue = BoundedTokenQueue::with_store(
            config(4, 0, 1, 60_000),
            idle_scheduler(),
            store.clone(),
        )
        .unwrap();
        assert_eq!(queue.hydrate().unwrap(), 2);
        assert_eq!(tokens(&queue), ["a", "b"]);
        assert_eq!(store.save_count(), 0, "hydration must not write back");
    }

    #[test]
    fn hydrate_load_failure_propagates() {
        let queue = BoundedTokenQueue::with_store(
            config(4, 0, 1, 60_000),
            idle_scheduler(),
            Arc::new(FailingStore),
        )
        .unwrap();
        assert!(queue.hydrate().is_err());
        assert!(queue.is_empty(), "failed hydration leaves the queue empty");
    }

    #[test]
    fn hydrate_without_store_is_empty_ok() {
        let queue = BoundedTokenQueue::new(config(4, 0, 1, 60_000), idle_scheduler()).unwrap();
        assert_eq!(queue.hydrate().unwrap(), 0);
    }

    #[test]
    fn successful_mutations_save_full_contents() {
        let store = Arc::new(RecordingStore::default());
        let queue = BoundedTokenQueue::with_store(
            config(4, 0, 0, 1_000),
            idle_scheduler(),
            store.clone(),
        )
        .unwrap();

        assert!(queue.admit_at("a", 1_000));
        assert!(queue.admit_at("b", 1_500));
        assert_eq!(store.save_count(), 2);
        let saved = store.last_save().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].token, "a", "saved contents are oldest-first");

        let removed = queue.evict_at(3_000);
        assert_eq!(removed.len(), 2);
        assert_eq!(store.save_count(), 3);
        assert!(store.last_save().unwrap().is_empty());
    }

    #[test]
    fn rejected_admission_does_not_save() {
        let store = Arc::new(RecordingStore::default());
        let queue = BoundedTokenQueue::with_store(
            config(4, 1_000, 1, 60_000),
            idle_scheduler(),
            store.clone(),
        )
        .unwrap();
        assert!(queue.admit_at("a", 1_000));
        assert!(!queue.admit_at("b", 1_100));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn save_failure_does_not_affect_admission_result() {
        let queue = BoundedTokenQueue::with_store(
            config(4, 0, 1, 60_000),
            idle_scheduler(),
            Arc::new(FailingStore),
        )
        .unwrap();
        assert!(queue.admit_at("a", 1_000));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.evict_at(i64::MAX - 1).len(), 0); // retain_tail floor
    }

    #[test]
    fn save_failure_does_not_suppress_eviction_result() {
        let queue = BoundedTokenQueue::with_store(
            config(4, 0, 0, 1_000),
            idle_scheduler(),
            Arc::new(FailingStore),
        )
        .unwrap();
        assert!(queue.admit_at("a", 1_000));
        let removed = queue.evict_at(10_000);
        assert_eq!(removed.len(), 1);
    }

    #[test]
    fn concurrent_admits_never_exceed_capacity() {
        let queue = Arc::new(
            BoundedTokenQueue::new(config(8, 0, 1, 60_000), idle_scheduler()).unwrap(),
        );
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        queue.admit_at(format!("{t}-{i}"), i64::from(i));
                        assert!(queue.snapshot().len() <= 8);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("admit thread panicked");
        }
        assert_eq!(queue.len(), 8);
    }

    #[test]
    fn concurrent_evict_and_admit_share_one_lock() {
        let queue = Arc::new(
            BoundedTokenQueue::new(config(16, 0, 0, 1), idle_scheduler()).unwrap(),
        );
        let writer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0..500i64 {
                    queue.admit_at(format!("t{i}"), i);
                }
            })
        };
        let sweeper = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    queue.evict_at(1_000_000);
                }
            })
        };
        writer.join().expect("writer panicked");
        sweeper.join().expect("sweeper panicked");
        assert!(queue.len() <= 16);
    }

    #[test]
    fn invalid_config_rejected_at_construction() {
        let bad = HistoryConfig {
            capacity: 2,
            cool_time: Duration::ZERO,
            retain_tail: 2,
            ttl: Duration::from_secs(1),
        };
        assert!(BoundedTokenQueue::new(bad, idle_scheduler()).is_err());
    }
}
