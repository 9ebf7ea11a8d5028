//! The process table, PID allocator, lifecycle manager, scheduler core and
//! sleep/wakeup — the lock-free heart of the subsystem.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

use array_macro::array;
use log::trace;
use scopeguard::ScopeGuard;

use crate::cpu::{pop_off, push_off, CPUS};
use crate::error::{KernelError, KernelResult};
use crate::file;
use crate::fs;
use crate::lock::RawSpinlock;
use crate::param::{MAXPROCNAME, NPROC};
use crate::riscv::{self, intr_get};
use crate::vm;

use super::{Context, Proc, Procstate, SleepLock, TrapFrame};

/// A tiny embedded "program": the first user process never runs real code
/// in this crate (no exec/ELF loader exists), so this is just a placeholder
/// blob `inituvm` copies into the fresh address space.
const INITCODE: &[u8] = &[0u8; 16];

pub struct ProcTable {
    pub(super) table: [Proc; NPROC],
    nextpid: AtomicI32,
    /// Guards writes to `Proc::parent` that are not made by the slot's own
    /// owner (i.e. `exit`'s reparenting) and the scan in `wait`.
    pub(crate) wait_lock: RawSpinlock,
    /// `+1`-biased index of the init process; `0` until `userinit` runs.
    initial_proc: AtomicUsize,
}

impl ProcTable {
    const fn new() -> Self {
        Self {
            table: array![_ => Proc::new(); NPROC],
            nextpid: AtomicI32::new(1),
            wait_lock: RawSpinlock::new("wait_lock"),
            initial_proc: AtomicUsize::new(0),
        }
    }

    fn index_of(&self, p: &Proc) -> usize {
        let base = self.table.as_ptr() as usize;
        let addr = p as *const Proc as usize;
        (addr - base) / core::mem::size_of::<Proc>()
    }

    fn initial_proc_index(&self) -> Option<usize> {
        let v = self.initial_proc.load(Ordering::Acquire);
        if v == 0 {
            None
        } else {
            Some(v - 1)
        }
    }

    fn set_initial_proc_index(&self, idx: usize) {
        self.initial_proc.store(idx + 1, Ordering::Release);
    }

    /// Finds the live slot with the given pid, if any.
    pub(super) fn find_by_pid(&self, pid: i32) -> Option<&Proc> {
        self.table
            .iter()
            .find(|p| p.state.load() != Procstate::Unused && p.pid() == pid)
    }

    /// Claims a fresh pid. Returns the value the CAS actually claimed, i.e.
    /// the pre-increment counter value — not `counter + 1`.
    fn allocpid(&self) -> i32 {
        loop {
            let cur = self.nextpid.load(Ordering::Relaxed);
            if self
                .nextpid
                .compare_exchange(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return cur;
            }
        }
    }

    /// Scans for an `Unused` slot and CASes it to `Embryo`. Restarts the
    /// scan from index 0 whenever a CAS attempt fails (another CPU raced
    /// onto that exact slot), rather than retrying in place.
    fn allocproc(&self) -> Option<usize> {
        'scan: loop {
            let mut saw_unused = false;
            for i in 0..NPROC {
                let p = &self.table[i];
                if p.state.load() != Procstate::Unused {
                    continue;
                }
                saw_unused = true;
                if !p.state.compare_exchange(Procstate::Unused, Procstate::Embryo) {
                    continue 'scan;
                }

                let pid = self.allocpid();
                p.pid.store(pid, Ordering::Relaxed);
                p.set_parent_index(None);
                p.chan.store(0, Ordering::Relaxed);
                p.killed.store(false, Ordering::Relaxed);
                // SAFETY: state is Embryo; only this allocation path touches
                // these fields until the slot is published as Runnable.
                unsafe {
                    *p.tf_mut() = TrapFrame::new();
                    let kstack_top = p.kstack_mut().as_mut_ptr() as usize
                        + core::mem::size_of_val(p.kstack_mut());
                    let mut ctx = Context::new();
                    ctx.ra = forkret_trampoline as usize;
                    ctx.sp = kstack_top;
                    *p.context_mut() = ctx;
                    *p.mem_mut() = None;
                    *p.cwd_mut() = None;
                    *p.name_mut() = [0; MAXPROCNAME];
                }
                for h in &p.signal_handlers {
                    h.store(crate::param::SIG_DFL, Ordering::Relaxed);
                }
                p.signal_mask.store(0, Ordering::Relaxed);
                p.pending_signals.store(0, Ordering::Relaxed);
                p.sig_stopped.store(false, Ordering::Relaxed);
                trace!("allocproc: slot {} -> Embryo, pid {}", i, pid);
                return Some(i);
            }
            if !saw_unused {
                return None;
            }
        }
    }
}

pub static PROCS: ProcTable = ProcTable::new();

/// Never actually entered: `swtch` is a no-op under test, and outside of
/// tests this crate never boots onto real hardware. Exists so `allocproc`
/// has a realistic instruction pointer to install.
extern "C" fn forkret_trampoline() -> ! {
    forkret();
    loop {
        core::hint::spin_loop();
    }
}

/// Returns the process currently bound to this CPU, if any.
pub fn myproc() -> Option<&'static Proc> {
    push_off();
    let cpu = CPUS.current_raw();
    // SAFETY: only this hart touches its own Cpu slot.
    let p = unsafe { (*cpu).proc };
    pop_off();
    // SAFETY: `p`, once non-null, always points into `PROCS.table`, which is
    // `'static`.
    unsafe { p.as_ref() }
}

/// Builds the first user process: a fresh address space, the embedded
/// initcode, and a trap frame primed to enter user mode at address 0.
pub fn userinit() {
    let i = PROCS.allocproc().expect("userinit: process table full");
    let p = &PROCS.table[i];
    let mut mem = vm::setupkvm().expect("userinit: out of memory");
    vm::inituvm(&mut mem, INITCODE).expect("userinit: out of memory");
    // SAFETY: slot is `Embryo`, not yet visible to other CPUs.
    unsafe {
        let tf = p.tf_mut();
        tf.epc = 0;
        tf.sp = mem.size();
        *p.mem_mut() = Some(mem);
        *p.cwd_mut() = fs::namei(b"/");
        p.name_mut()[..4].copy_from_slice(b"init");
    }
    assert!(
        p.state.compare_exchange(Procstate::Embryo, Procstate::Runnable),
        "userinit: CAS Embryo -> Runnable failed"
    );
    PROCS.set_initial_proc_index(i);
}

/// Grows or shrinks the current process's user image by `n` bytes.
pub fn growproc(n: isize) -> KernelResult<()> {
    let p = myproc().expect("growproc: no current process");
    // SAFETY: the slot's owner (this CPU, running this process) is the sole
    // accessor of its `mem` field.
    unsafe {
        let mem = p.mem_mut().as_mut().expect("growproc: no address space");
        let old = mem.size();
        if n > 0 {
            vm::allocuvm(mem, old, old + n as usize)?;
        } else if n < 0 {
            vm::deallocuvm(mem, old, old - (-n) as usize);
        }
        vm::switchuvm(mem);
    }
    Ok(())
}

/// Forks the current process. Returns the child's pid to the parent.
pub fn fork() -> KernelResult<i32> {
    let p = myproc().expect("fork: no current process");
    let parent_idx = PROCS.index_of(p);
    let ci = PROCS.allocproc().ok_or(KernelError::NoFreeProc)?;
    let child = &PROCS.table[ci];

    // Released back to `Unused` on any early return unless defused below.
    let child = scopeguard::guard(child, |child| {
        child.pid.store(0, Ordering::Relaxed);
        assert!(
            child.state.compare_exchange(Procstate::Embryo, Procstate::Unused),
            "fork: failed to release child slot after copyuvm failure"
        );
    });

    // SAFETY: child slot is `Embryo` (invisible to the scheduler); parent
    // slot's non-state fields are only read here, by the parent itself.
    let copy_result = unsafe {
        let parent_mem = p.mem_mut().as_ref().expect("fork: parent has no address space");
        vm::copyuvm(parent_mem)
    };
    let child_mem = copy_result?;
    let child = ScopeGuard::into_inner(child);

    // SAFETY: see above.
    unsafe {
        *child.mem_mut() = Some(child_mem);
        *child.tf_mut() = *p.tf_mut();
        child.tf_mut().a0 = 0;
        child.set_parent_index(Some(parent_idx));
        for (dst, src) in child.ofile_mut().iter_mut().zip(p.ofile_mut().iter()) {
            *dst = src.map(file::filedup);
        }
        *child.cwd_mut() = p.cwd_mut().as_ref().map(fs::idup);
        *child.name_mut() = p.name();
    }
    for (dst, src) in child.signal_handlers.iter().zip(p.signal_handlers.iter()) {
        dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
    }
    child
        .signal_mask
        .store(p.signal_mask.load(Ordering::Relaxed), Ordering::Relaxed);
    // pending_signals is deliberately left at 0: it is not inherited.

    let pid = child.pid();
    assert!(
        child.state.compare_exchange(Procstate::Embryo, Procstate::Runnable),
        "fork: CAS Embryo -> Runnable failed"
    );
    Ok(pid)
}

/// Terminates the current process. Never returns.
pub fn exit() -> ! {
    let p = myproc().expect("exit: no current process");
    let my_idx = PROCS.index_of(p);

    fs::begin_op();
    // SAFETY: the exiting process is the sole owner of its own file table
    // and cwd until it is reaped.
    unsafe {
        for slot in p.ofile_mut().iter_mut() {
            if let Some(f) = slot.take() {
                file::fileclose(f);
            }
        }
        if let Some(cwd) = p.cwd_mut().take() {
            fs::iput(cwd);
        }
    }
    fs::end_op();

    PROCS.wait_lock.acquire();
    if let Some(parent_idx) = p.parent_index() {
        wakeup1(PROCS.table[parent_idx].addr());
    }
    let init_idx = PROCS.initial_proc_index().expect("exit: init process missing");
    assert!(my_idx != init_idx, "init exiting");
    for child in PROCS.table.iter() {
        if child.parent_index() == Some(my_idx) {
            child.set_parent_index(Some(init_idx));
            if child.state.load() == Procstate::Zombie {
                wakeup1(PROCS.table[init_idx].addr());
            }
        }
    }
    PROCS.wait_lock.release();

    // Deliberately unpaired: like the scheduler's own bracket, this level is
    // consumed by whichever process resumes next, via `forkret`'s (or
    // `proc_yield`/`sleep`'s post-`sched`) `pop_off`. `exit` never returns to
    // pop it itself.
    push_off();
    assert!(
        p.state.compare_exchange(Procstate::Running, Procstate::NegZombie),
        "exit: CAS Running -> NegZombie failed"
    );
    sched();
    unreachable!("exit: a reaped zombie resumed execution");
}

/// Waits for a child to exit, reaps it, and returns its pid.
pub fn wait() -> KernelResult<i32> {
    let p = myproc().expect("wait: no current process");
    let my_idx = PROCS.index_of(p);
    loop {
        PROCS.wait_lock.acquire();
        let mut have_child = false;
        let mut reaped_pid = None;
        for child in PROCS.table.iter() {
            if child.parent_index() != Some(my_idx) {
                continue;
            }
            have_child = true;
            if child.state.compare_exchange(Procstate::Zombie, Procstate::Unused) {
                let pid = child.pid();
                // SAFETY: slot is being reaped; no other CPU can observe it
                // as anything but Unused-in-progress until this finishes.
                let mem = unsafe { child.mem_mut().take() };
                if let Some(mem) = mem {
                    vm::freevm(mem);
                }
                child.pid.store(0, Ordering::Relaxed);
                child.set_parent_index(None);
                child.killed.store(false, Ordering::Relaxed);
                unsafe {
                    *child.name_mut() = [0; MAXPROCNAME];
                }
                reaped_pid = Some(pid);
                break;
            }
        }
        PROCS.wait_lock.release();

        if let Some(pid) = reaped_pid {
            return Ok(pid);
        }
        if !have_child || p.is_killed() {
            return Err(KernelError::NoFreeChild);
        }
        sleep(p.addr(), SleepLock::None);
    }
}

/// Called with interrupts disabled, with the caller's `NEG_*` state already
/// written: switches from the current process's context back to this CPU's
/// scheduler context. Saves and restores the interrupt-enable flag across
/// the switch, since it is a property of the process being switched away
/// from, not of the CPU itself.
fn sched() {
    let p = myproc().expect("sched: no current process");
    debug_assert!(p.state.load() != Procstate::Running, "sched: still running");
    debug_assert!(!intr_get(), "sched: interrupts enabled");
    let cpu = CPUS.current_raw();
    // SAFETY: only this hart touches its own Cpu slot.
    unsafe {
        assert_eq!((*cpu).noff(), 1, "sched: locks held when switching away");
    }
    // SAFETY: see above.
    let intena = unsafe { (*cpu).interrupt_enabled() };
    // SAFETY: this CPU's scheduler context is only touched by this CPU, and
    // `p`'s context is only touched by `p`'s current owner.
    unsafe {
        super::swtch(p.context_mut() as *mut Context, &mut (*cpu).context as *mut Context);
    }
    // SAFETY: see above.
    unsafe {
        (*cpu).set_interrupt_enabled(intena);
    }
}

/// Transitions the current process from `Running` to `NegRunnable` and
/// enters the scheduler.
pub fn proc_yield() {
    let p = myproc().expect("yield: no current process");
    push_off();
    assert!(
        p.state.compare_exchange(Procstate::Running, Procstate::NegRunnable),
        "yield: CAS Running -> NegRunnable failed"
    );
    sched();
    pop_off();
}

/// Entry point of any freshly scheduled-in process. Performs one-time,
/// in-process initialization the first time any process is ever scheduled.
static FIRST_SCHED: AtomicBool = AtomicBool::new(true);

pub fn forkret() {
    // Still holding the interrupt-disable level `scheduler` pushed before
    // switching to us; release it before running as a normal process.
    pop_off();
    if FIRST_SCHED.swap(false, Ordering::AcqRel) {
        fs::iinit();
        fs::initlog();
    }
}

/// Binds the current process to wait channel `chan` and blocks until woken.
pub fn sleep(chan: usize, lk: SleepLock<'_>) {
    let p = myproc().expect("sleep: no current process");
    push_off();
    p.chan.store(chan, Ordering::Relaxed);
    while !p.state.compare_exchange(Procstate::Running, Procstate::NegSleeping) {
        // Only this process ever moves itself out of Running, so this loop
        // should not actually iterate more than once in practice.
        p.chan.store(chan, Ordering::Relaxed);
    }
    if let SleepLock::External(lock) = lk {
        lock.release();
    }
    sched();
    p.chan.store(0, Ordering::Relaxed);
    if let SleepLock::External(lock) = lk {
        lock.acquire();
    }
    pop_off();
}

/// Wakes every process sleeping on `chan`. Must be called with interrupts
/// already disabled.
fn wakeup1(chan: usize) {
    for p in PROCS.table.iter() {
        if p.chan.load(Ordering::Relaxed) != chan {
            continue;
        }
        if p.state.compare_exchange(Procstate::Sleeping, Procstate::NegRunnable) {
            continue;
        }
        // The sleeper hasn't finished entering `Sleeping` yet; stake our
        // claim on `NegSleeping` so the scheduler's finalization (which
        // would otherwise leave it at plain `Sleeping`) promotes it to
        // `Runnable` instead. See the lost-wakeup protocol.
        let _ = p.state.compare_exchange(Procstate::NegSleeping, Procstate::NegRunnable);
    }
}

/// Wakes every process sleeping on `chan`.
pub fn wakeup(chan: usize) {
    push_off();
    wakeup1(chan);
    pop_off();
}

/// The per-CPU scheduler loop. Never returns.
pub fn scheduler() -> ! {
    loop {
        // SAFETY: paired intr_on/push_off bracket matching spec's scheduler
        // loop: briefly service interrupts, then run the lock-free scan with
        // interrupts disabled.
        unsafe { riscv::intr_on() };
        push_off();
        for p in PROCS.table.iter() {
            if !p.state.compare_exchange(Procstate::Runnable, Procstate::Running) {
                continue;
            }
            let cpu = CPUS.current_raw();
            // SAFETY: only this hart touches its own Cpu slot.
            unsafe {
                (*cpu).proc = p as *const Proc;
            }
            // SAFETY: slot is `Running`, owned by this CPU for the duration
            // of the switch.
            unsafe {
                let mem = p.mem_mut().as_ref().expect("scheduler: process has no address space");
                vm::switchuvm(mem);
                super::swtch(&mut (*cpu).context as *mut Context, p.context_mut() as *mut Context);
                vm::switchkvm();
                (*cpu).proc = ptr::null();
            }
            finalize(p);
        }
        pop_off();
    }
}

/// Finalizes the intermediate state a process leaves behind on return from
/// `swtch`, per the scheduler's half of the lost-wakeup protocol.
fn finalize(p: &Proc) {
    match p.state.load() {
        Procstate::NegSleeping => {
            if !p.state.compare_exchange(Procstate::NegSleeping, Procstate::Sleeping) {
                // A concurrent wakeup1 already raced this slot to
                // NegRunnable; finish what it started.
                let _ = p.state.compare_exchange(Procstate::NegRunnable, Procstate::Runnable);
            }
        }
        Procstate::NegRunnable => {
            let _ = p.state.compare_exchange(Procstate::NegRunnable, Procstate::Runnable);
        }
        Procstate::NegZombie => {
            if p.state.compare_exchange(Procstate::NegZombie, Procstate::Zombie) {
                PROCS.wait_lock.acquire();
                if let Some(parent_idx) = p.parent_index() {
                    wakeup1(PROCS.table[parent_idx].addr());
                }
                PROCS.wait_lock.release();
            }
        }
        _ => {}
    }
}

impl super::Proc {
    /// This slot's wait-channel identity, used by a process sleeping on "one
    /// of my children changed state" (i.e. in `wait`), and by `exit` to wake
    /// it.
    pub fn addr(&self) -> usize {
        self.wchan.addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::riscv::set_test_hart_id;

    fn reset_hart(id: usize) {
        set_test_hart_id(id);
    }

    #[test]
    fn allocpid_is_strictly_increasing_and_unique() {
        reset_hart(10);
        let a = PROCS.allocpid();
        let b = PROCS.allocpid();
        assert!(b > a);
    }

    #[test]
    fn allocproc_then_free_slot_is_reusable() {
        reset_hart(11);
        let i = PROCS.allocproc().expect("slot available");
        let p = &PROCS.table[i];
        assert_eq!(p.state.load(), Procstate::Embryo);
        assert!(p.pid() > 0);
        // Free it back up like a failed fork would.
        p.pid.store(0, Ordering::Relaxed);
        assert!(p.state.compare_exchange(Procstate::Embryo, Procstate::Unused));
        assert_eq!(p.state.load(), Procstate::Unused);
    }

    #[test]
    fn table_full_returns_none() {
        reset_hart(12);
        let mut taken = alloc_all();
        assert!(PROCS.allocproc().is_none());
        for i in taken.drain(..) {
            let p = &PROCS.table[i];
            p.pid.store(0, Ordering::Relaxed);
            assert!(p.state.compare_exchange(Procstate::Embryo, Procstate::Unused));
        }
    }

    fn alloc_all() -> std::vec::Vec<usize> {
        let mut v = std::vec::Vec::new();
        while let Some(i) = PROCS.allocproc() {
            v.push(i);
        }
        v
    }

    #[test]
    fn wakeup1_resolves_case_a_race() {
        reset_hart(13);
        let i = PROCS.allocproc().expect("slot available");
        let p = &PROCS.table[i];
        p.pid.store(0, Ordering::Relaxed);
        assert!(p.state.compare_exchange(Procstate::Embryo, Procstate::Running));

        let chan = 0xBEEF;
        p.chan.store(chan, Ordering::Relaxed);
        // Case A: the sleeper has announced NegSleeping but the scheduler
        // has not yet finalized it when the waker runs.
        assert!(p.state.compare_exchange(Procstate::Running, Procstate::NegSleeping));
        wakeup1(chan);
        assert_eq!(p.state.load(), Procstate::NegRunnable);

        // The scheduler's finalization must now promote straight to Runnable.
        finalize(p);
        assert_eq!(p.state.load(), Procstate::Runnable);

        assert!(p.state.compare_exchange(Procstate::Runnable, Procstate::Unused));
    }

    #[test]
    fn wakeup1_resolves_case_b_direct_sleep() {
        reset_hart(14);
        let i = PROCS.allocproc().expect("slot available");
        let p = &PROCS.table[i];
        p.pid.store(0, Ordering::Relaxed);
        assert!(p.state.compare_exchange(Procstate::Embryo, Procstate::Running));

        let chan = 0xF00D;
        p.chan.store(chan, Ordering::Relaxed);
        assert!(p.state.compare_exchange(Procstate::Running, Procstate::NegSleeping));
        // Scheduler finalizes first: Case B requires the sleeper to have
        // fully reached Sleeping before the waker runs.
        finalize(p);
        assert_eq!(p.state.load(), Procstate::Sleeping);

        wakeup1(chan);
        assert_eq!(p.state.load(), Procstate::NegRunnable);
        finalize(p);
        assert_eq!(p.state.load(), Procstate::Runnable);

        assert!(p.state.compare_exchange(Procstate::Runnable, Procstate::Unused));
    }
}
