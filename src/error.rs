//! The error type returned by fallible kernel operations.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The process table has no `UNUSED` slot left.
    NoFreeProc,
    /// A process was asked to wait for a child it does not have.
    NoFreeChild,
    /// A signal number was `>= SIG_SIZE`.
    BadSignum,
    /// `kill`/`signal` was given a pid with no matching process.
    NoSuchProcess,
    /// The page allocator ran out of pages.
    OutOfMemory,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::NoFreeProc => "no free process slot",
            KernelError::NoFreeChild => "no child to wait for",
            KernelError::BadSignum => "signal number out of range",
            KernelError::NoSuchProcess => "no such process",
            KernelError::OutOfMemory => "out of memory",
        };
        f.write_str(msg)
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
