//! Physical page allocator stand-in.
//!
//! The real allocator carves free pages out of the range between the
//! kernel's `end` symbol and `PHYSTOP`; there is no such physical memory
//! layout here, so `Kmem` just counts pages out of a fixed-size pool.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::lock::RawSpinlock;

const NPAGES: usize = 4096;

struct Kmem {
    lock: RawSpinlock,
    free: AtomicUsize,
}

static KMEM: Kmem = Kmem {
    lock: RawSpinlock::new("kmem"),
    free: AtomicUsize::new(NPAGES),
};

/// Allocates one page, or `None` if the pool is exhausted.
pub fn kalloc() -> Option<()> {
    KMEM.lock.acquire();
    let prev = KMEM.free.load(Ordering::Relaxed);
    let taken = if prev == 0 {
        None
    } else {
        KMEM.free.store(prev - 1, Ordering::Relaxed);
        Some(())
    };
    KMEM.lock.release();
    taken
}

/// Returns one page to the pool.
pub fn kfree() {
    KMEM.lock.acquire();
    let prev = KMEM.free.load(Ordering::Relaxed);
    debug_assert!(prev < NPAGES, "kfree: double free");
    KMEM.free.store(prev + 1, Ordering::Relaxed);
    KMEM.lock.release();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_free_recovers_capacity() {
        let before = KMEM.free.load(Ordering::Relaxed);
        kalloc().unwrap();
        kfree();
        assert_eq!(KMEM.free.load(Ordering::Relaxed), before);
    }
}
