//! Thread-affinitized object pooling
//!
//! A simple synchronized pool would lock a stack and push/pop on
//! return/take. [`SyncPool`] reduces locking by exploiting the case where an
//! item is taken and returned by the same thread, which is the common
//! pattern on send/receive paths.
//!
//! Initially all quota belongs to a global locked pool. As threads take and
//! return values we record their ids, and once a thread has returned enough
//! values through the global pool we "promote" it: the global quota shrinks
//! by one and the thread gets a dedicated slot it can use without taking any
//! locks. A promoted thread that exits strands its slot; when promotion
//! later fails for lack of free slots often enough, the whole slot table is
//! reset and quota flows back to the global pool, so active threads are
//! re-promoted as they keep working.
//!
//! Promotion and reset are driven by counters with thresholds, so a pool
//! misconfigured with too little quota for its workload does not thrash
//! between promoting and rebuilding. The counters are heuristics; they use
//! relaxed atomics and do not need to be perfect.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

const MAX_PENDING_ENTRIES: usize = 128;
const MAX_PROMOTION_FAILURES: u32 = 64;
const MAX_RETURNS_BEFORE_PROMOTION: u32 = 64;
const MAX_THREAD_ITEMS_PER_PROCESSOR: usize = 16;

/// Sentinel owner id for an unassigned slot.
const NO_THREAD: u64 = 0;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static POOL_THREAD_ID: Cell<u64> = const { Cell::new(NO_THREAD) };
}

/// Opaque pool-local identity of the calling thread.
///
/// Ids are handed out from a process-wide counter and never reused, so a
/// dead thread's id can never be confused with a live one.
fn current_thread_id() -> u64 {
    POOL_THREAD_ID.with(|cell| {
        let id = cell.get();
        if id != NO_THREAD {
            return id;
        }
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        cell.set(id);
        id
    })
}

/// Deallocation hook applied to values the pool can no longer keep:
/// rejected returns, evictions on quota shrink, and `clear`.
pub type Dealloc<T> = Box<dyn Fn(T) + Send + Sync>;

/// One dedicated per-thread slot.
///
/// `owner` is written only under the promotion lock; `value` is swapped
/// atomically, so readers never observe a partially-updated slot.
struct Slot<T> {
    owner: AtomicU64,
    value: AtomicPtr<T>,
}

impl<T> Slot<T> {
    fn empty() -> Self {
        Self {
            owner: AtomicU64::new(NO_THREAD),
            value: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Swap the held value out, if any.
    fn take_value(&self) -> Option<T> {
        let p = self.value.swap(ptr::null_mut(), Ordering::AcqRel);
        if p.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer in a slot always came from
            // `Box::into_raw` in `put_value`, and the swap above transferred
            // exclusive ownership of it to us.
            Some(*unsafe { Box::from_raw(p) })
        }
    }

    /// Store a value if the slot is empty; hands the value back otherwise.
    fn put_value(&self, value: T) -> std::result::Result<(), T> {
        let boxed = Box::into_raw(Box::new(value));
        match self
            .value
            .compare_exchange(ptr::null_mut(), boxed, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            // SAFETY: the CAS failed, so `boxed` was never published and we
            // still own it exclusively.
            Err(_) => Err(*unsafe { Box::from_raw(boxed) }),
        }
    }
}

/// A pending observation: how often a thread has returned through the
/// global pool since it was first seen.
struct PendingSlot {
    thread: AtomicU64,
    returns: AtomicU32,
}

impl PendingSlot {
    fn empty() -> Self {
        Self {
            thread: AtomicU64::new(NO_THREAD),
            returns: AtomicU32::new(0),
        }
    }
}

/// Heuristic counters for observing pool behavior.
///
/// All counters are relaxed; they exist for tracing and tests, not for
/// correctness.
#[derive(Default)]
pub struct PoolStats {
    global_takes: AtomicU64,
    global_returns: AtomicU64,
    promotions: AtomicU64,
    resets: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Take attempts that fell through to the global pool.
    pub global_takes: u64,
    /// Returns deposited into the global pool.
    pub global_returns: u64,
    /// Successful thread promotions.
    pub promotions: u64,
    /// Full slot-table resets.
    pub resets: u64,
}

/// Low-lock object pool with per-thread dedicated slots and a bounded
/// global fallback.
///
/// Safe for unsynchronized concurrent use from many threads; the
/// steady-state same-thread take/return path is lock-free.
pub struct SyncPool<T> {
    slots: Box<[Slot<T>]>,
    pending: Box<[PendingSlot]>,
    global: GlobalPool<T>,
    max_count: usize,
    promotion_failures: AtomicU32,
    promotion_lock: Mutex<()>,
    dealloc: Option<Dealloc<T>>,
    stats: PoolStats,
}

impl<T: Send> SyncPool<T> {
    /// Create a pool bounded to `max_count` values overall.
    #[must_use]
    pub fn new(max_count: usize) -> Self {
        Self::build(max_count, None)
    }

    /// Create a pool with a deallocation hook for values it must discard.
    #[must_use]
    pub fn with_dealloc(max_count: usize, dealloc: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::build(max_count, Some(Box::new(dealloc) as Dealloc<T>))
    }

    fn build(max_count: usize, dealloc: Option<Dealloc<T>>) -> Self {
        let slot_count = max_count.min(MAX_THREAD_ITEMS_PER_PROCESSOR + num_cpus::get());
        Self {
            slots: (0..slot_count).map(|_| Slot::empty()).collect(),
            pending: (0..MAX_PENDING_ENTRIES).map(|_| PendingSlot::empty()).collect(),
            global: GlobalPool::new(max_count),
            max_count,
            promotion_failures: AtomicU32::new(0),
            promotion_lock: Mutex::new(()),
            dealloc,
            stats: PoolStats::default(),
        }
    }

    /// Take a pooled value, preferring the calling thread's dedicated slot.
    pub fn take(&self) -> Option<T> {
        let tid = current_thread_id();

        if let Some(value) = self.take_local(tid) {
            return Some(value);
        }

        self.record_global_take(tid);
        self.stats.global_takes.fetch_add(1, Ordering::Relaxed);
        self.global.take()
    }

    /// Return a value to the pool.
    ///
    /// Returns `true` if the value was pooled; a value the pool cannot keep
    /// is handed to the deallocation hook (or dropped) and `false` comes
    /// back.
    pub fn return_value(&self, value: T) -> bool {
        let tid = current_thread_id();

        match self.return_local(tid, value) {
            Ok(()) => true,
            Err(value) => self.return_global(tid, value),
        }
    }

    /// Visit every slot, discard any held value through the deallocation
    /// hook, and empty the global pool.
    ///
    /// Slot ownership survives a clear; promoted threads keep their slots.
    pub fn clear(&self) {
        let _guard = self.promotion_lock.lock();
        for slot in self.slots.iter() {
            if let Some(value) = slot.take_value() {
                self.discard(value);
            }
        }
        for value in self.global.drain() {
            self.discard(value);
        }
    }

    /// Drain every pooled value out of the pool without discarding them.
    ///
    /// Used when a backing pool is rebuilt at a new quota and its contents
    /// transfer to the replacement.
    pub fn drain(&self) -> Vec<T> {
        let _guard = self.promotion_lock.lock();
        let mut out = Vec::new();
        for slot in self.slots.iter() {
            if let Some(value) = slot.take_value() {
                out.push(value);
            }
        }
        out.extend(self.global.drain());
        out
    }

    /// Snapshot of the heuristic counters.
    #[must_use]
    pub fn stats(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            global_takes: self.stats.global_takes.load(Ordering::Relaxed),
            global_returns: self.stats.global_returns.load(Ordering::Relaxed),
            promotions: self.stats.promotions.load(Ordering::Relaxed),
            resets: self.stats.resets.load(Ordering::Relaxed),
        }
    }

    fn discard(&self, value: T) {
        if let Some(dealloc) = &self.dealloc {
            dealloc(value);
        }
    }

    fn take_local(&self, tid: u64) -> Option<T> {
        for slot in self.slots.iter() {
            let owner = slot.owner.load(Ordering::Acquire);
            if owner == tid {
                return slot.take_value();
            }
            if owner == NO_THREAD {
                break;
            }
        }
        None
    }

    fn return_local(&self, tid: u64, value: T) -> std::result::Result<(), T> {
        for slot in self.slots.iter() {
            let owner = slot.owner.load(Ordering::Acquire);
            if owner == tid {
                return slot.put_value(value);
            }
            if owner == NO_THREAD {
                break;
            }
        }
        Err(value)
    }

    fn return_global(&self, tid: u64, value: T) -> bool {
        self.record_global_return(tid);
        self.stats.global_returns.fetch_add(1, Ordering::Relaxed);
        match self.global.return_value(value) {
            Ok(()) => true,
            Err(rejected) => {
                self.discard(rejected);
                false
            }
        }
    }

    /// Register the calling thread in the observation table on its first
    /// trip through the global pool.
    fn record_global_take(&self, tid: u64) {
        for pending in self.pending.iter() {
            let owner = pending.thread.load(Ordering::Relaxed);
            if owner == tid {
                return;
            }
            if owner == NO_THREAD
                && pending
                    .thread
                    .compare_exchange(NO_THREAD, tid, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                pending.returns.store(0, Ordering::Relaxed);
                return;
            }
        }

        // Table exhausted: throw the observations away and start over.
        for pending in self.pending.iter() {
            pending.returns.store(0, Ordering::Relaxed);
            pending.thread.store(NO_THREAD, Ordering::Relaxed);
        }
    }

    fn record_global_return(&self, tid: u64) {
        for pending in self.pending.iter() {
            let owner = pending.thread.load(Ordering::Relaxed);
            if owner == tid {
                let count = pending.returns.load(Ordering::Relaxed) + 1;
                if count >= MAX_RETURNS_BEFORE_PROMOTION {
                    pending.returns.store(0, Ordering::Relaxed);
                    if !self.promote_thread(tid) {
                        self.handle_promotion_failure(tid);
                    }
                } else {
                    pending.returns.store(count, Ordering::Relaxed);
                }
                return;
            }
            if owner == NO_THREAD {
                // Threads register on the take path only.
                return;
            }
        }
    }

    /// Reserve a dedicated slot for `tid`, shrinking the global quota by
    /// one to pay for it.
    fn promote_thread(&self, tid: u64) -> bool {
        let _guard = self.promotion_lock.lock();
        for slot in self.slots.iter() {
            let owner = slot.owner.load(Ordering::Acquire);
            if owner == tid {
                return true;
            }
            if owner == NO_THREAD {
                if let Some(evicted) = self.global.decrement_max() {
                    self.discard(evicted);
                }
                slot.owner.store(tid, Ordering::Release);
                self.stats.promotions.fetch_add(1, Ordering::Relaxed);
                trace!("[POOL] promoted thread {tid}");
                return true;
            }
        }
        false
    }

    fn handle_promotion_failure(&self, tid: u64) {
        let failures = self.promotion_failures.load(Ordering::Relaxed) + 1;

        if failures >= MAX_PROMOTION_FAILURES {
            self.reset_slots();
            self.promote_thread(tid);
        } else {
            self.promotion_failures.store(failures, Ordering::Relaxed);
        }
    }

    /// Tear down every thread affinity and give all reserved quota back to
    /// the global pool. Values stranded in slots transfer to the global
    /// pool rather than leaking.
    fn reset_slots(&self) {
        let mut stranded = Vec::new();
        {
            let _guard = self.promotion_lock.lock();
            for slot in self.slots.iter() {
                if let Some(value) = slot.take_value() {
                    stranded.push(value);
                }
                slot.owner.store(NO_THREAD, Ordering::Release);
            }
            self.global.set_max(self.max_count);
            self.stats.resets.fetch_add(1, Ordering::Relaxed);
        }
        for value in stranded {
            if let Err(rejected) = self.global.return_value(value) {
                self.discard(rejected);
            }
        }
        debug!("[POOL] slot table reset, quota restored to {}", self.max_count);
    }
}

impl<T> Drop for SyncPool<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            if let Some(value) = slot.take_value() {
                if let Some(dealloc) = &self.dealloc {
                    dealloc(value);
                }
            }
        }
        for value in self.global.drain() {
            if let Some(dealloc) = &self.dealloc {
                dealloc(value);
            }
        }
    }
}

/// Bounded, lock-protected stack with an adjustable maximum capacity.
///
/// The fallback store for unpromoted threads, and the whole pool for large
/// buffer classes where thread affinity buys nothing.
pub struct GlobalPool<T> {
    items: Mutex<Vec<T>>,
    len: AtomicUsize,
    max: AtomicUsize,
}

impl<T> GlobalPool<T> {
    /// Create a pool bounded to `max_count` values.
    #[must_use]
    pub fn new(max_count: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            len: AtomicUsize::new(0),
            max: AtomicUsize::new(max_count),
        }
    }

    /// Current maximum capacity.
    #[must_use]
    pub fn max_count(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    /// Number of pooled values (heuristic, may be stale under contention).
    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the pool currently holds no values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop a value, with an optimistic unlocked emptiness check.
    pub fn take(&self) -> Option<T> {
        if self.len.load(Ordering::Relaxed) == 0 {
            return None;
        }

        let mut items = self.items.lock();
        let value = items.pop();
        if value.is_some() {
            self.len.store(items.len(), Ordering::Relaxed);
        }
        value
    }

    /// Push a value, with an optimistic unlocked fullness check. Hands the
    /// value back if the pool is at capacity.
    pub fn return_value(&self, value: T) -> std::result::Result<(), T> {
        if self.len.load(Ordering::Relaxed) >= self.max.load(Ordering::Relaxed) {
            return Err(value);
        }

        let mut items = self.items.lock();
        if items.len() >= self.max.load(Ordering::Relaxed) {
            return Err(value);
        }
        items.push(value);
        self.len.store(items.len(), Ordering::Relaxed);
        Ok(())
    }

    /// Lower the capacity by one, evicting one value first if the pool is
    /// exactly full. The evicted value is handed back to the caller.
    pub fn decrement_max(&self) -> Option<T> {
        let mut items = self.items.lock();
        let max = self.max.load(Ordering::Relaxed);
        let evicted = if items.len() == max { items.pop() } else { None };
        self.max.store(max.saturating_sub(1), Ordering::Relaxed);
        self.len.store(items.len(), Ordering::Relaxed);
        evicted
    }

    /// Raise or lower the capacity, evicting down to the new limit. Evicted
    /// values are handed back to the caller.
    pub fn set_max(&self, max_count: usize) -> Vec<T> {
        let mut items = self.items.lock();
        let mut evicted = Vec::new();
        while items.len() > max_count {
            if let Some(value) = items.pop() {
                evicted.push(value);
            }
        }
        self.max.store(max_count, Ordering::Relaxed);
        self.len.store(items.len(), Ordering::Relaxed);
        evicted
    }

    /// Remove and hand back every pooled value.
    pub fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock();
        let out = std::mem::take(&mut *items);
        self.len.store(0, Ordering::Relaxed);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn thread_ids_are_stable_and_nonzero() {
        let a = current_thread_id();
        let b = current_thread_id();
        assert_eq!(a, b);
        assert_ne!(a, NO_THREAD);

        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(other, a);
    }

    #[test]
    fn global_pool_respects_capacity() {
        let pool = GlobalPool::new(2);
        assert!(pool.return_value(1).is_ok());
        assert!(pool.return_value(2).is_ok());
        assert_eq!(pool.return_value(3), Err(3));

        assert_eq!(pool.take(), Some(2));
        assert_eq!(pool.take(), Some(1));
        assert_eq!(pool.take(), None);
    }

    #[test]
    fn global_pool_decrement_evicts_only_at_capacity() {
        let pool = GlobalPool::new(2);
        pool.return_value(7).unwrap();
        // One item, capacity two: no eviction needed.
        assert_eq!(pool.decrement_max(), None);
        assert_eq!(pool.max_count(), 1);
        // Now exactly full, so the next decrement evicts.
        assert_eq!(pool.decrement_max(), Some(7));
        assert_eq!(pool.max_count(), 0);
    }

    #[test]
    fn sync_pool_same_thread_roundtrip() {
        let pool = SyncPool::new(8);
        assert_eq!(pool.take(), None);
        assert!(pool.return_value(42u32));
        assert_eq!(pool.take(), Some(42));
    }

    #[test]
    fn clear_routes_values_through_dealloc() {
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = freed.clone();
        let pool = SyncPool::with_dealloc(8, move |_v: u32| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        assert!(pool.return_value(1));
        assert!(pool.return_value(2));
        pool.clear();
        assert_eq!(freed.load(Ordering::Relaxed), 2);
        assert_eq!(pool.take(), None);
    }
}
