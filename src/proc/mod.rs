//! The process lifecycle and scheduling core: process table, PID allocator,
//! lock-free state machine, per-CPU scheduler, sleep/wakeup and the signal
//! engine.

mod signal;
mod table;
mod wait_channel;

pub use signal::{handle_signals, kill, sigprocmask, signal, sigret, SIGNAL_TRAMPOLINE};
pub use table::{
    exit, fork, forkret, growproc, myproc, proc_yield, scheduler, sleep, userinit, wait, wakeup,
    ProcTable, PROCS,
};
pub use wait_channel::WaitChannel;

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::fs::Inode;
use crate::lock::RawSpinlock;
use crate::param::{KSTACKSIZE, MAXPROCNAME, NOFILE, SIG_DFL, SIG_SIZE};
use crate::vm::UserMemory;

/// Callee-saved kernel register snapshot, loaded/saved by `swtch`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

/// Architectural register snapshot captured on every kernel entry; enough to
/// resume user execution. Only the fields the lifecycle manager and signal
/// engine actually touch are named; the rest of the frame is opaque padding.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TrapFrame {
    /// Saved program counter (`sepc`); where execution resumes in user mode.
    pub epc: usize,
    /// Saved user stack pointer.
    pub sp: usize,
    /// The `a0` argument/return register. `fork` zeroes this in the child so
    /// it observes a 0 return value.
    pub a0: usize,
    /// The `a1` argument register, used for the signal trampoline's second
    /// argument (the saved stack pointer).
    pub a1: usize,
    /// The syscall number register (`a7` on RISC-V).
    pub num: usize,
    _rest: [usize; 27],
}

impl TrapFrame {
    pub const fn new() -> Self {
        Self {
            epc: 0,
            sp: 0,
            a0: 0,
            a1: 0,
            num: 0,
            _rest: [0; 27],
        }
    }

    /// True while this frame represents a trap taken from user mode. The
    /// real check inspects `sstatus.SPP`; here we treat `epc == 0` (the
    /// initial, never-entered-user state) as "not user mode" so `forkret`'s
    /// very first pass and freshly `allocproc`'d slots are no-ops for the
    /// signal engine.
    pub fn is_user_trap(&self) -> bool {
        self.epc != 0
    }
}

#[cfg(not(test))]
extern "C" {
    /// Saves callee-saved registers at `*from`, loads them from `*to`.
    pub fn swtch(from: *mut Context, to: *mut Context);
}

#[cfg(test)]
/// Host test stand-in: state-machine unit tests never actually transfer
/// control, so this only needs to exist to satisfy the linker-shaped calls.
pub unsafe fn swtch(_from: *mut Context, _to: *mut Context) {}

/// The nine lifecycle states a process slot can be in. Encoded into a `u32`
/// and mutated only through `AtomicState::compare_exchange`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Procstate {
    Unused = 0,
    Embryo = 1,
    Sleeping = 2,
    NegSleeping = 3,
    Runnable = 4,
    NegRunnable = 5,
    Running = 6,
    Zombie = 7,
    NegZombie = 8,
}

impl Procstate {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => Procstate::Unused,
            1 => Procstate::Embryo,
            2 => Procstate::Sleeping,
            3 => Procstate::NegSleeping,
            4 => Procstate::Runnable,
            5 => Procstate::NegRunnable,
            6 => Procstate::Running,
            7 => Procstate::Zombie,
            8 => Procstate::NegZombie,
            _ => unreachable!("invalid encoded Procstate"),
        }
    }
}

/// The atomic cell backing `Proc::state`.
#[derive(Debug)]
pub struct AtomicState(AtomicU32);

impl AtomicState {
    const fn new(s: Procstate) -> Self {
        Self(AtomicU32::new(s as u32))
    }

    pub fn load(&self) -> Procstate {
        Procstate::from_u32(self.0.load(Ordering::Acquire))
    }

    /// Attempts the transition `from -> to`. Returns `true` on success.
    pub fn compare_exchange(&self, from: Procstate, to: Procstate) -> bool {
        self.0
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A process table slot.
pub struct Proc {
    pub state: AtomicState,
    pid: AtomicI32,
    /// Index into `PROCS.table` of the parent, `+1`-biased so that `0` means
    /// "no parent". Mutated by a non-owner only during `exit`'s reparenting,
    /// which holds `PROCS.wait_lock`.
    parent: AtomicUsize,
    /// The wait channel this slot is sleeping on, as a raw address. Only
    /// meaningful while `state` is `Sleeping` or `NegSleeping`.
    chan: AtomicUsize,
    killed: AtomicBool,

    /// This slot's own wait-channel identity, woken by `exit` when a child
    /// of this process changes state. See `wait`.
    wchan: WaitChannel,

    context: core::cell::UnsafeCell<Context>,
    kstack: core::cell::UnsafeCell<[u8; KSTACKSIZE]>,
    mem: core::cell::UnsafeCell<Option<UserMemory>>,
    tf: core::cell::UnsafeCell<TrapFrame>,
    ofile: core::cell::UnsafeCell<[Option<crate::file::File>; NOFILE]>,
    cwd: core::cell::UnsafeCell<Option<Inode>>,
    name: core::cell::UnsafeCell<[u8; MAXPROCNAME]>,

    signal_handlers: [AtomicUsize; SIG_SIZE],
    signal_mask: AtomicU32,
    pending_signals: AtomicU32,
    sig_stopped: AtomicBool,
    signal_mask_backup: AtomicU32,
    tf_backup: core::cell::UnsafeCell<Option<TrapFrame>>,
}

// SAFETY: every `UnsafeCell` field above is written only by the slot's
// current owner (the CPU running this slot, or the scheduler while the slot
// is not `Running`), matching spec's non-state-field ownership rule.
unsafe impl Sync for Proc {}

impl Proc {
    const fn new() -> Self {
        Self {
            state: AtomicState::new(Procstate::Unused),
            pid: AtomicI32::new(0),
            parent: AtomicUsize::new(0),
            chan: AtomicUsize::new(0),
            killed: AtomicBool::new(false),
            wchan: WaitChannel::new(),
            context: core::cell::UnsafeCell::new(Context::new()),
            kstack: core::cell::UnsafeCell::new([0; KSTACKSIZE]),
            mem: core::cell::UnsafeCell::new(None),
            tf: core::cell::UnsafeCell::new(TrapFrame::new()),
            ofile: core::cell::UnsafeCell::new([None; NOFILE]),
            cwd: core::cell::UnsafeCell::new(None),
            name: core::cell::UnsafeCell::new([0; MAXPROCNAME]),
            signal_handlers: [const { AtomicUsize::new(SIG_DFL) }; SIG_SIZE],
            signal_mask: AtomicU32::new(0),
            pending_signals: AtomicU32::new(0),
            sig_stopped: AtomicBool::new(false),
            signal_mask_backup: AtomicU32::new(0),
            tf_backup: core::cell::UnsafeCell::new(None),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::Relaxed)
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Relaxed)
    }

    pub fn set_killed(&self) {
        self.killed.store(true, Ordering::Relaxed);
    }

    fn parent_index(&self) -> Option<usize> {
        let p = self.parent.load(Ordering::Acquire);
        if p == 0 {
            None
        } else {
            Some(p - 1)
        }
    }

    fn set_parent_index(&self, idx: Option<usize>) {
        self.parent
            .store(idx.map_or(0, |i| i + 1), Ordering::Release);
    }

    /// # Safety
    /// Caller must not alias this with another live reference to the same field.
    #[allow(clippy::mut_from_ref)]
    unsafe fn context_mut(&self) -> &mut Context {
        unsafe { &mut *self.context.get() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn tf_mut(&self) -> &mut TrapFrame {
        unsafe { &mut *self.tf.get() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn kstack_mut(&self) -> &mut [u8; KSTACKSIZE] {
        unsafe { &mut *self.kstack.get() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn mem_mut(&self) -> &mut Option<UserMemory> {
        unsafe { &mut *self.mem.get() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn ofile_mut(&self) -> &mut [Option<crate::file::File>; NOFILE] {
        unsafe { &mut *self.ofile.get() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn cwd_mut(&self) -> &mut Option<Inode> {
        unsafe { &mut *self.cwd.get() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn name_mut(&self) -> &mut [u8; MAXPROCNAME] {
        unsafe { &mut *self.name.get() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn tf_backup_mut(&self) -> &mut Option<TrapFrame> {
        unsafe { &mut *self.tf_backup.get() }
    }

    pub fn name(&self) -> [u8; MAXPROCNAME] {
        // SAFETY: read-only snapshot; name is only mutated at alloc/fork time
        // by the slot's sole owner, never concurrently with this read in
        // practice (debug/log use only).
        unsafe { *self.name.get() }
    }

    /// True while this process is currently inside a user-mode trap, i.e.
    /// the point where a syscall dispatch or signal delivery is legal.
    pub fn in_user_trap(&self) -> bool {
        // SAFETY: read-only snapshot of a field only this process's owner
        // writes, from that same owner's call path (syscall dispatch).
        unsafe { (*self.tf.get()).is_user_trap() }
    }

    /// Reads the nth syscall argument register (`a0`/`a1`). This crate's
    /// syscalls never need more than two.
    pub fn syscall_arg(&self, n: usize) -> usize {
        // SAFETY: see `in_user_trap`.
        let tf = unsafe { &*self.tf.get() };
        match n {
            0 => tf.a0,
            1 => tf.a1,
            _ => unreachable!("syscall_arg: index {} out of range", n),
        }
    }

    /// The pending syscall number (`a7`), set by the trap path before dispatch.
    pub fn syscall_num(&self) -> usize {
        // SAFETY: see `in_user_trap`.
        unsafe { (*self.tf.get()).num }
    }

    /// Writes the syscall return value into `a0`.
    pub fn set_syscall_ret(&self, val: usize) {
        // SAFETY: see `in_user_trap`.
        unsafe { (*self.tf.get()).a0 = val };
    }

    /// The current size of this process's address space, or 0 if it has
    /// none yet. Used by `sbrk` to report the break before growth.
    pub fn mem_size(&self) -> usize {
        // SAFETY: read-only snapshot; `mem` is only mutated by this slot's
        // own owner.
        unsafe { (*self.mem.get()).as_ref().map_or(0, UserMemory::size) }
    }

    /// Test-only access to this slot's trap frame, for sibling modules'
    /// tests that need to set up or inspect trap state directly.
    #[cfg(test)]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn tf_mut_for_test(&self) -> &mut TrapFrame {
        unsafe { &mut *self.tf.get() }
    }

    /// Test-only access to this slot's address space, for sibling modules'
    /// tests.
    #[cfg(test)]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn mem_mut_for_test(&self) -> &mut Option<UserMemory> {
        unsafe { &mut *self.mem.get() }
    }
}

/// The legacy `ptable.lock` sentinel passed to `sleep`. `External` means the
/// caller holds a real external spinlock that must be released before
/// sleeping and reacquired on wakeup; `None` means the caller holds no
/// external lock (the historical all-`sleep`-calls-hold-`ptable.lock` case,
/// now just an identity with no acquire/release behind it).
pub enum SleepLock<'a> {
    None,
    External(&'a RawSpinlock),
}
