//! File-system stand-in.
//!
//! Inodes, directories and the crash-recoverable transaction log are all out
//! of scope. `Inode` is an opaque reference-counted handle (enough to model
//! `cwd`), and `begin_op`/`end_op` bracket the handful of calls in the
//! lifecycle manager that would, in a full kernel, need to be inside a file
//! system transaction.

use core::sync::atomic::{AtomicUsize, Ordering};

/// An inode reference, reference counted across `dup`/`fork`. Stands in for
/// a directory entry; the root directory is the only one ever produced here.
#[derive(Debug, Clone)]
pub struct Inode {
    refcnt: &'static AtomicUsize,
}

static ROOT_REFCNT: AtomicUsize = AtomicUsize::new(0);

/// Performs a path lookup. Only `/` resolves; anything else is `None`.
pub fn namei(path: &[u8]) -> Option<Inode> {
    if path == b"/" {
        ROOT_REFCNT.fetch_add(1, Ordering::Relaxed);
        Some(Inode {
            refcnt: &ROOT_REFCNT,
        })
    } else {
        None
    }
}

/// Increments an inode's refcount, for `fork`'s `cwd` duplication.
pub fn idup(ino: &Inode) -> Inode {
    ino.refcnt.fetch_add(1, Ordering::Relaxed);
    ino.clone()
}

/// Drops a reference to an inode, for `exit`.
pub fn iput(ino: Inode) {
    ino.refcnt.fetch_sub(1, Ordering::Relaxed);
}

/// Marks the start of a file-system transaction.
pub fn begin_op() {}

/// Marks the end of a file-system transaction.
pub fn end_op() {}

/// One-time inode cache initialization, performed in `forkret`'s first pass.
pub fn iinit() {}

/// One-time log recovery, performed in `forkret`'s first pass.
pub fn initlog() {}
