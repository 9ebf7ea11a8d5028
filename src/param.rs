//! Compile-time kernel configuration.

/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 32;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// Size of a process's kernel stack, in bytes.
pub const KSTACKSIZE: usize = 4096;

/// Number of signals a process can handle. Valid signums are `[0, SIG_SIZE)`.
pub const SIG_SIZE: usize = 32;

/// Disposition values for `Proc::signal_handlers`: run the kernel default
/// action for the signal.
pub const SIG_DFL: usize = 0;

/// Disposition value meaning the signal is ignored entirely.
pub const SIG_IGN: usize = 1;

pub const SIGKILL: u32 = 9;
pub const SIGSTOP: u32 = 19;
pub const SIGCONT: u32 = 18;
