//! Tiered native-buffer manager
//!
//! Owns a geometric ladder of buffer size classes, each backed by a
//! [`SyncPool`] (small and medium sizes) or a plain bounded locked stack
//! (large sizes, where rare allocations make thread affinity pointless).
//! Per-class quotas start at one buffer and are retuned at runtime: when a
//! class keeps missing at full quota, the manager steals a quota unit from
//! the class wasting the most bytes and gives it to the starved one.
//!
//! Every pooled buffer is canonical for its class: takes allocate the
//! class's nominal size, never the raw requested size. Requests beyond the
//! ladder bypass pooling entirely.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::alloc::{NativeAlloc, NativeBuf};
use crate::error::{Result, StageError};
use crate::pool::{GlobalPool, SyncPool};

/// Smallest rung of the size-class ladder.
pub const MIN_BUFFER_SIZE: usize = 128;

/// Classes at or above this size use a plain locked stack instead of a
/// thread-affinitized pool.
pub const LARGE_BUFFER_THRESHOLD: usize = 85_000;

const INITIAL_BUFFER_COUNT: usize = 1;
const MAX_MISSES_BEFORE_TUNING: u32 = 8;

/// Point-in-time statistics for one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStat {
    /// Nominal buffer size of the class.
    pub size: usize,
    /// Current quota (maximum pooled buffers).
    pub quota: usize,
    /// Buffers currently held by the class's pool.
    pub pooled: usize,
    /// High-water mark of `pooled` since the quota last changed.
    pub peak: usize,
    /// Misses at full quota since the last retuning.
    pub misses: u32,
}

/// The backing store of one size class.
enum Backend {
    Affinity(SyncPool<NativeBuf>),
    Large(GlobalPool<NativeBuf>),
}

/// One rung of the ladder: a bounded pool plus its tuning statistics.
///
/// Rebuilt wholesale when the quota changes; the statistics travel with the
/// backing pool, so `peak` restarts from the transferred count.
struct ClassPool {
    quota: usize,
    pooled: AtomicUsize,
    peak: AtomicUsize,
    misses: AtomicU32,
    backend: Backend,
    alloc: Arc<dyn NativeAlloc>,
}

impl ClassPool {
    fn new(size: usize, quota: usize, alloc: Arc<dyn NativeAlloc>) -> Self {
        let backend = if size < LARGE_BUFFER_THRESHOLD {
            let hook_alloc = alloc.clone();
            Backend::Affinity(SyncPool::with_dealloc(quota, move |buf| hook_alloc.free(buf)))
        } else {
            Backend::Large(GlobalPool::new(quota))
        };
        Self {
            quota,
            pooled: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            misses: AtomicU32::new(0),
            backend,
            alloc,
        }
    }

    fn take(&self) -> Option<NativeBuf> {
        match &self.backend {
            Backend::Affinity(pool) => pool.take(),
            Backend::Large(stack) => stack.take(),
        }
    }

    /// Attempt to pool a returned buffer; frees it if the pool is full.
    /// Returns whether the buffer was pooled.
    fn return_buf(&self, buf: NativeBuf) -> bool {
        match &self.backend {
            Backend::Affinity(pool) => pool.return_value(buf),
            Backend::Large(stack) => match stack.return_value(buf) {
                Ok(()) => true,
                Err(rejected) => {
                    self.alloc.free(rejected);
                    false
                }
            },
        }
    }

    fn drain(&self) -> Vec<NativeBuf> {
        match &self.backend {
            Backend::Affinity(pool) => pool.drain(),
            Backend::Large(stack) => stack.drain(),
        }
    }

    fn clear(&self) {
        match &self.backend {
            Backend::Affinity(pool) => pool.clear(),
            Backend::Large(stack) => {
                for buf in stack.drain() {
                    self.alloc.free(buf);
                }
            }
        }
        self.pooled.store(0, Ordering::Relaxed);
    }

    // The counters are heuristics mirroring pool traffic; they tolerate
    // lost updates under contention.

    fn decrement_pooled(&self) {
        let count = self.pooled.load(Ordering::Relaxed);
        if count > 0 {
            self.pooled.store(count - 1, Ordering::Relaxed);
        }
    }

    fn increment_pooled(&self) {
        let count = self.pooled.load(Ordering::Relaxed) + 1;
        if count > self.quota {
            return;
        }
        self.pooled.store(count, Ordering::Relaxed);
        if count > self.peak.load(Ordering::Relaxed) {
            self.peak.store(count, Ordering::Relaxed);
        }
    }

    fn at_full_quota(&self) -> bool {
        self.peak.load(Ordering::Relaxed) == self.quota
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for ClassPool {
    fn drop(&mut self) {
        // The affinity pool frees through its own hook; the large stack
        // needs explicit help.
        if let Backend::Large(stack) = &self.backend {
            for buf in stack.drain() {
                self.alloc.free(buf);
            }
        }
    }
}

struct SizeClass {
    size: usize,
    pool: RwLock<ClassPool>,
}

/// Tiered buffer manager with adaptive quota tuning.
///
/// `Σ(class.size × class.quota)` never exceeds the configured byte ceiling;
/// the slack after a quota change is bounded by one class's size.
pub struct BufferManager {
    classes: Box<[SizeClass]>,
    sizes: Box<[usize]>,
    alloc: Arc<dyn NativeAlloc>,
    memory_limit: i64,
    remaining: AtomicI64,
    total_misses: AtomicU32,
    tuning: Mutex<()>,
}

impl BufferManager {
    /// Build the ladder: sizes double from [`MIN_BUFFER_SIZE`] up to
    /// `max_buffer_size`, each class seeded with a one-buffer quota while
    /// the byte budget lasts.
    pub fn new(
        max_pool_bytes: i64,
        max_buffer_size: usize,
        alloc: Arc<dyn NativeAlloc>,
    ) -> Result<Self> {
        if max_pool_bytes <= 0 {
            return Err(StageError::invalid_argument(
                "max_pool_bytes",
                "must be positive",
            ));
        }

        let mut remaining = max_pool_bytes;
        let mut classes = Vec::new();
        let mut sizes = Vec::new();

        let mut size = MIN_BUFFER_SIZE;
        loop {
            let affordable = (remaining / size as i64).max(0) as usize;
            let quota = affordable.min(INITIAL_BUFFER_COUNT);

            classes.push(SizeClass {
                size,
                pool: RwLock::new(ClassPool::new(size, quota, alloc.clone())),
            });
            sizes.push(size);
            remaining -= (quota * size) as i64;

            if size >= max_buffer_size {
                break;
            }
            size = (size * 2).min(max_buffer_size);
        }

        Ok(Self {
            classes: classes.into_boxed_slice(),
            sizes: sizes.into_boxed_slice(),
            alloc,
            memory_limit: max_pool_bytes,
            remaining: AtomicI64::new(remaining),
            total_misses: AtomicU32::new(0),
            tuning: Mutex::new(()),
        })
    }

    /// The configured byte ceiling.
    #[must_use]
    pub const fn memory_limit(&self) -> i64 {
        self.memory_limit
    }

    /// Nominal sizes of the ladder, ascending.
    #[must_use]
    pub fn class_sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Take a buffer of at least `size` bytes.
    ///
    /// Within the ladder the buffer's length equals the matching class's
    /// nominal size; beyond it, exactly `size` bytes are allocated and the
    /// buffer is never pooled.
    pub fn take_buffer(&self, size: usize) -> Result<NativeBuf> {
        let Some(index) = self.find_class(size) else {
            trace!("[MANAGER] oversized take: {size} bytes, bypassing pools");
            return self.alloc.alloc(size);
        };

        let class = &self.classes[index];
        let mut should_tune = false;
        {
            let pool = class.pool.read();
            if let Some(buf) = pool.take() {
                pool.decrement_pooled();
                return Ok(buf);
            }

            if pool.at_full_quota() {
                pool.record_miss();
                let misses = self.total_misses.fetch_add(1, Ordering::Relaxed) + 1;
                if misses >= MAX_MISSES_BEFORE_TUNING {
                    should_tune = true;
                }
            }
        }

        if should_tune {
            self.tune_quotas();
        }

        // Always the class's nominal size, so every pooled buffer stays
        // canonical for its class.
        self.alloc.alloc(class.size)
    }

    /// Return a buffer to its size class.
    ///
    /// A buffer whose length matches no class at all (an oversized one-off)
    /// is freed and the return is a no-op; a length that lands inside the
    /// ladder without matching its class's nominal size exactly is an
    /// error.
    pub fn return_buffer(&self, buf: NativeBuf) -> Result<()> {
        let Some(index) = self.find_class(buf.len()) else {
            self.alloc.free(buf);
            return Ok(());
        };

        let class = &self.classes[index];
        if buf.len() != class.size {
            let len = buf.len();
            self.alloc.free(buf);
            return Err(StageError::invalid_argument(
                "buf",
                format!("length {len} does not match the class size {}", class.size),
            ));
        }

        let pool = class.pool.read();
        if pool.return_buf(buf) {
            pool.increment_pooled();
        }
        Ok(())
    }

    /// Rebalance quotas from miss/peak statistics.
    ///
    /// Single-flight: a concurrent caller that cannot acquire the tuning
    /// lock is a no-op. Steals one quota unit from the most excessive class
    /// when the spare budget cannot cover the most starved class, then
    /// grows the starved class if the budget allows. All miss counters
    /// reset afterwards.
    pub fn tune_quotas(&self) {
        let Some(_guard) = self.tuning.try_lock() else {
            return;
        };

        if let Some(starved) = self.find_most_starved() {
            let starved_size = self.classes[starved].size as i64;

            if self.remaining.load(Ordering::Relaxed) < starved_size {
                if let Some(excessive) = self.find_most_excessive() {
                    self.change_quota(excessive, -1);
                }
            }

            if self.remaining.load(Ordering::Relaxed) >= starved_size {
                self.change_quota(starved, 1);
            }
        }

        for class in self.classes.iter() {
            class.pool.read().misses.store(0, Ordering::Relaxed);
        }
        self.total_misses.store(0, Ordering::Relaxed);
    }

    /// Free every pooled buffer. Invoked when the owning socket closes.
    pub fn clear(&self) {
        for class in self.classes.iter() {
            class.pool.read().clear();
        }
        debug!("[MANAGER] cleared all pooled buffers");
    }

    /// Per-class statistics, ladder order.
    #[must_use]
    pub fn class_stats(&self) -> Vec<ClassStat> {
        self.classes
            .iter()
            .map(|class| {
                let pool = class.pool.read();
                ClassStat {
                    size: class.size,
                    quota: pool.quota,
                    pooled: pool.pooled.load(Ordering::Relaxed),
                    peak: pool.peak.load(Ordering::Relaxed),
                    misses: pool.misses.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Index of the smallest class whose nominal size covers `size`.
    fn find_class(&self, size: usize) -> Option<usize> {
        self.sizes.iter().position(|&class_size| size <= class_size)
    }

    /// The class at full quota with the highest cumulative missed-byte
    /// volume.
    fn find_most_starved(&self) -> Option<usize> {
        let mut max_bytes_missed = 0i64;
        let mut index = None;

        for (i, class) in self.classes.iter().enumerate() {
            let pool = class.pool.read();
            if pool.peak.load(Ordering::Relaxed) != pool.quota {
                continue;
            }
            let bytes_missed = i64::from(pool.misses.load(Ordering::Relaxed)) * class.size as i64;
            if bytes_missed > max_bytes_missed {
                max_bytes_missed = bytes_missed;
                index = Some(i);
            }
        }

        index
    }

    /// The class under quota with the highest unused-byte volume.
    fn find_most_excessive(&self) -> Option<usize> {
        let mut max_bytes_in_excess = 0i64;
        let mut index = None;

        for (i, class) in self.classes.iter().enumerate() {
            let pool = class.pool.read();
            let peak = pool.peak.load(Ordering::Relaxed);
            if peak >= pool.quota {
                continue;
            }
            let bytes_in_excess = (pool.quota - peak) as i64 * class.size as i64;
            if bytes_in_excess > max_bytes_in_excess {
                max_bytes_in_excess = bytes_in_excess;
                index = Some(i);
            }
        }

        index
    }

    /// Rebuild a class's backing pool at `quota ± 1`, draining and
    /// transferring the buffers it holds. A buffer that no longer fits the
    /// shrunken pool is freed.
    fn change_quota(&self, index: usize, delta: i64) {
        let class = &self.classes[index];
        let mut slot = class.pool.write();

        let new_quota = (slot.quota as i64 + delta).max(0) as usize;
        let fresh = ClassPool::new(class.size, new_quota, self.alloc.clone());
        for buf in slot.drain() {
            if fresh.return_buf(buf) {
                fresh.increment_pooled();
            }
        }

        self.remaining
            .fetch_sub(class.size as i64 * delta, Ordering::Relaxed);
        debug!(
            "[MANAGER] quota of {}-byte class changed to {new_quota}",
            class.size
        );
        *slot = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::HeapAlloc;

    fn manager(budget: i64, max_size: usize) -> BufferManager {
        BufferManager::new(budget, max_size, Arc::new(HeapAlloc)).unwrap()
    }

    #[test]
    fn ladder_doubles_up_to_the_cap() {
        let m = manager(1 << 20, 2048);
        assert_eq!(m.class_sizes(), &[128, 256, 512, 1024, 2048]);
    }

    #[test]
    fn ladder_clamps_final_class_to_max_size() {
        let m = manager(1 << 20, 3000);
        assert_eq!(m.class_sizes(), &[128, 256, 512, 1024, 2048, 3000]);
    }

    #[test]
    fn find_class_picks_smallest_covering_size() {
        let m = manager(1 << 20, 2048);
        assert_eq!(m.find_class(1), Some(0));
        assert_eq!(m.find_class(128), Some(0));
        assert_eq!(m.find_class(129), Some(1));
        assert_eq!(m.find_class(2048), Some(4));
        assert_eq!(m.find_class(2049), None);
    }

    #[test]
    fn non_positive_budget_is_rejected() {
        assert!(BufferManager::new(0, 2048, Arc::new(HeapAlloc)).is_err());
        assert!(BufferManager::new(-5, 2048, Arc::new(HeapAlloc)).is_err());
    }
}
