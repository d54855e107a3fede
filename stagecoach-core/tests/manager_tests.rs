//! Integration tests for the tiered buffer manager

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use stagecoach_core::alloc::{HeapAlloc, NativeAlloc, NativeBuf};
use stagecoach_core::error::Result;
use stagecoach_core::manager::BufferManager;

/// Heap allocator that counts every alloc and free crossing the seam.
#[derive(Default)]
struct CountingAlloc {
    heap: HeapAlloc,
    allocs: AtomicUsize,
    frees: AtomicUsize,
}

impl CountingAlloc {
    fn allocs(&self) -> usize {
        self.allocs.load(Ordering::SeqCst)
    }

    fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }
}

impl NativeAlloc for CountingAlloc {
    fn alloc(&self, size: usize) -> Result<NativeBuf> {
        let buf = self.heap.alloc(size)?;
        self.allocs.fetch_add(1, Ordering::SeqCst);
        Ok(buf)
    }

    fn free(&self, buf: NativeBuf) {
        self.frees.fetch_add(1, Ordering::SeqCst);
        self.heap.free(buf);
    }
}

/// In-ladder takes hand out the class's nominal size; beyond the ladder the
/// buffer is exactly as large as requested.
#[test]
fn test_takes_are_canonical_within_the_ladder() {
    let manager = BufferManager::new(1 << 20, 2048, Arc::new(HeapAlloc)).unwrap();

    let small = manager.take_buffer(100).unwrap();
    assert_eq!(small.len(), 128);
    manager.return_buffer(small).unwrap();

    let exact = manager.take_buffer(512).unwrap();
    assert_eq!(exact.len(), 512);
    manager.return_buffer(exact).unwrap();

    let oversized = manager.take_buffer(5000).unwrap();
    assert_eq!(oversized.len(), 5000);
    manager.return_buffer(oversized).unwrap();
}

/// A returned buffer is reused before the allocator is asked again.
#[test]
fn test_returned_buffers_are_reused() {
    let alloc = Arc::new(CountingAlloc::default());
    let manager = BufferManager::new(1 << 20, 2048, alloc.clone()).unwrap();

    let first = manager.take_buffer(100).unwrap();
    let addr = first.as_ptr() as usize;
    assert_eq!(alloc.allocs(), 1);
    manager.return_buffer(first).unwrap();

    let second = manager.take_buffer(100).unwrap();
    assert_eq!(second.as_ptr() as usize, addr);
    assert_eq!(alloc.allocs(), 1);
    manager.return_buffer(second).unwrap();
}

/// A length inside the ladder that matches no class exactly is an error,
/// but the buffer is still freed rather than leaked.
#[test]
fn test_mismatched_return_frees_and_errors() {
    let alloc = Arc::new(CountingAlloc::default());
    let manager = BufferManager::new(1 << 20, 2048, alloc.clone()).unwrap();

    let odd = alloc.alloc(300).unwrap();
    assert!(manager.return_buffer(odd).is_err());
    assert_eq!(alloc.frees(), 1);
}

/// Oversized buffers never enter a pool: returning one frees it quietly.
#[test]
fn test_oversized_return_is_a_freeing_noop() {
    let alloc = Arc::new(CountingAlloc::default());
    let manager = BufferManager::new(1 << 20, 2048, alloc.clone()).unwrap();

    let big = manager.take_buffer(5000).unwrap();
    assert_eq!(alloc.allocs(), 1);
    manager.return_buffer(big).unwrap();
    assert_eq!(alloc.frees(), 1);

    // A second take allocates afresh.
    let big = manager.take_buffer(5000).unwrap();
    assert_eq!(alloc.allocs(), 2);
    manager.return_buffer(big).unwrap();
}

/// The quota ledger never promises more bytes than the configured ceiling.
#[test]
fn test_quotas_respect_the_byte_ceiling() {
    for budget in [128i64, 1024, 4096, 1 << 20] {
        let manager = BufferManager::new(budget, 2048, Arc::new(HeapAlloc)).unwrap();
        let committed: i64 = manager
            .class_stats()
            .iter()
            .map(|stat| (stat.size * stat.quota) as i64)
            .sum();
        assert!(
            committed <= budget,
            "committed {committed} bytes against a {budget}-byte ceiling"
        );
    }
}

/// A 128-byte budget seeds only the first class.
#[test]
fn test_tight_budget_seeds_only_the_smallest_class() {
    let manager = BufferManager::new(128, 2048, Arc::new(HeapAlloc)).unwrap();
    let quotas: Vec<usize> = manager.class_stats().iter().map(|s| s.quota).collect();
    assert_eq!(quotas, vec![1, 0, 0, 0, 0]);
}

/// Sustained misses on a zero-quota class steal quota units from the idle
/// classes until the starved class can grow.
#[test]
fn test_misses_retune_quotas_toward_demand() {
    let alloc = Arc::new(CountingAlloc::default());
    // Ladder [128, 256, 512, 1024] with quotas [1, 1, 1, 0]: the budget
    // runs out before the largest class gets a buffer.
    let manager = BufferManager::new(1024, 1024, alloc.clone()).unwrap();
    let quotas: Vec<usize> = manager.class_stats().iter().map(|s| s.quota).collect();
    assert_eq!(quotas, vec![1, 1, 1, 0]);

    // Each round of eight misses triggers one retuning pass; the first two
    // only reclaim budget from the idle 512- and 256-byte classes, the
    // third finally affords the 1024-byte class its buffer.
    for _ in 0..3 {
        for _ in 0..8 {
            let buf = manager.take_buffer(1000).unwrap();
            manager.return_buffer(buf).unwrap();
        }
    }

    let quotas: Vec<usize> = manager.class_stats().iter().map(|s| s.quota).collect();
    assert_eq!(quotas, vec![0, 0, 0, 1]);

    // The grown class now pools: one allocation serves every further take.
    let buf = manager.take_buffer(1000).unwrap();
    manager.return_buffer(buf).unwrap();
    let allocs_before = alloc.allocs();
    let buf = manager.take_buffer(1000).unwrap();
    assert_eq!(alloc.allocs(), allocs_before);
    manager.return_buffer(buf).unwrap();
}

/// Classes past the large-buffer threshold still pool and reuse.
#[test]
fn test_large_classes_pool_through_the_locked_stack() {
    let alloc = Arc::new(CountingAlloc::default());
    let manager = BufferManager::new(1 << 20, 200_000, alloc.clone()).unwrap();

    let sizes = manager.class_sizes();
    assert_eq!(sizes[sizes.len() - 2..], [131_072, 200_000]);

    let buf = manager.take_buffer(150_000).unwrap();
    assert_eq!(buf.len(), 200_000);
    let addr = buf.as_ptr() as usize;
    manager.return_buffer(buf).unwrap();

    let buf = manager.take_buffer(150_000).unwrap();
    assert_eq!(buf.as_ptr() as usize, addr);
    assert_eq!(alloc.allocs(), 1);
    manager.return_buffer(buf).unwrap();
}

/// Clearing the manager hands every pooled buffer back to the allocator.
#[test]
fn test_clear_frees_every_pooled_buffer() {
    let alloc = Arc::new(CountingAlloc::default());
    let manager = BufferManager::new(1 << 20, 2048, alloc.clone()).unwrap();

    for size in [100, 500, 2000] {
        let buf = manager.take_buffer(size).unwrap();
        manager.return_buffer(buf).unwrap();
    }
    assert_eq!(alloc.allocs(), 3);
    assert_eq!(alloc.frees(), 0);

    manager.clear();
    assert_eq!(alloc.frees(), 3);
}
