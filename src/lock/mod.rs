//! The lock module: the mutual-exclusion spin lock used to protect a handful
//! of non-lock-free state (the page allocator, the console, and the
//! reparenting path's `parent` pointers).

mod spinlock;

pub use spinlock::RawSpinlock;
