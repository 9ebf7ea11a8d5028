//! POSIX-style signal delivery: a pending/mask/handler bitmask triple per
//! process, the kernel-default actions for `SIGKILL`/`SIGSTOP`/`SIGCONT`, and
//! staging of user-space handler invocations through an opaque trampoline
//! blob copied onto the user stack.

use core::sync::atomic::Ordering;

use crate::error::{KernelError, KernelResult};
use crate::param::{SIG_DFL, SIG_IGN, SIG_SIZE, SIGCONT, SIGSTOP};
use crate::vm::{self, UserMemory};

use super::table::{myproc, proc_yield, PROCS};
use super::Procstate;

/// Stand-in for the assembly `call_sigret_start..call_sigret_end` blob: a
/// short stub that would invoke `sigret` on return from a user handler. No
/// real user code ever runs in this crate, but the copy path that stages
/// these bytes (plus the handler's arguments) onto the user stack is still
/// exercised and tested.
pub static SIGNAL_TRAMPOLINE: &[u8] = &[0u8; 8];

/// Sends `signum` to the process with the given pid.
pub fn kill(pid: i32, signum: u32) -> KernelResult<()> {
    if signum as usize >= SIG_SIZE {
        return Err(KernelError::BadSignum);
    }
    match PROCS.find_by_pid(pid) {
        Some(p) => {
            // A sleeping process may not be stopped: its sleep is not on the
            // signal engine's radar, so SIGSTOP has nothing to interrupt.
            if !(p.state.load() == Procstate::Sleeping && signum == SIGSTOP) {
                p.pending_signals.fetch_or(1 << signum, Ordering::AcqRel);
            }
            Ok(())
        }
        None => Err(KernelError::NoSuchProcess),
    }
}

/// Atomically replaces the caller's signal mask, returning the previous one.
pub fn sigprocmask(mask: u32) -> u32 {
    let p = myproc().expect("sigprocmask: no current process");
    p.signal_mask.swap(mask, Ordering::AcqRel)
}

/// Replaces the caller's handler for `signum`, returning the previous one.
pub fn signal(signum: u32, handler: usize) -> KernelResult<usize> {
    if signum as usize >= SIG_SIZE {
        return Err(KernelError::BadSignum);
    }
    let p = myproc().expect("signal: no current process");
    Ok(p.signal_handlers[signum as usize].swap(handler, Ordering::AcqRel))
}

/// Restores the caller's trap frame and signal mask from the backups taken
/// when a user handler was staged, completing a handler's return.
pub fn sigret() {
    let p = myproc().expect("sigret: no current process");
    // SAFETY: only a process's own owner ever touches its tf/tf_backup, and
    // only at its own kernel/user boundary.
    unsafe {
        if let Some(backup) = p.tf_backup_mut().take() {
            *p.tf_mut() = backup;
        }
    }
    let mask = p.signal_mask_backup.load(Ordering::Acquire);
    p.signal_mask.store(mask, Ordering::Release);
}

fn is_masked(p: &super::Proc, signum: u32) -> bool {
    p.signal_mask.load(Ordering::Acquire) & (1 << signum) != 0
}

fn is_pending(p: &super::Proc, signum: u32) -> bool {
    p.pending_signals.load(Ordering::Acquire) & (1 << signum) != 0
}

fn handle_kernel_signal(p: &super::Proc, signum: u32) {
    match signum {
        SIGSTOP => p.sig_stopped.store(true, Ordering::Release),
        SIGCONT => p.sig_stopped.store(false, Ordering::Release),
        // SIGKILL, and any other signal left at its default disposition.
        _ => p.set_killed(),
    }
}

/// Copies the trampoline and its two arguments (the saved stack pointer,
/// then the signum) below `sp`, returning the new stack pointer.
fn stage_trampoline(mem: &UserMemory, sp: usize, signum: u32) -> KernelResult<usize> {
    let sp = vm::copy_out(mem, sp, SIGNAL_TRAMPOLINE)?;
    let sp = vm::copy_out(mem, sp, &(sp as u32).to_ne_bytes())?;
    vm::copy_out(mem, sp, &signum.to_ne_bytes())
}

/// Stages a user-space handler invocation: backs up the mask and trap frame,
/// masks every signal, and rewires the trap frame to enter `handler` on the
/// user stack, arranged so its return runs the trampoline into `sigret`.
/// Returns `false` (leaving the signal for a later pass) if the stack copy
/// fails, e.g. because the process has no address space yet.
fn handle_user_signal(p: &super::Proc, signum: u32, handler: usize) -> bool {
    // SAFETY: see `sigret`.
    let original = unsafe { *p.tf_mut() };
    let mem = match unsafe { p.mem_mut().as_ref() } {
        Some(mem) => mem,
        None => return false,
    };
    let new_sp = match stage_trampoline(mem, original.sp, signum) {
        Ok(sp) => sp,
        Err(_) => return false,
    };

    p.signal_mask_backup
        .store(p.signal_mask.load(Ordering::Acquire), Ordering::Release);
    // SAFETY: see `sigret`.
    unsafe {
        *p.tf_backup_mut() = Some(original);
        let tf = p.tf_mut();
        tf.sp = new_sp;
        tf.epc = handler;
    }
    p.signal_mask.store(u32::MAX, Ordering::Release);
    true
}

/// Called at every exit from the kernel back to user mode. A no-op unless
/// the current trap frame represents a user-mode trap.
pub fn handle_signals() {
    let p = match myproc() {
        Some(p) => p,
        None => return,
    };
    if !p.in_user_trap() {
        return;
    }
    loop {
        if p.sig_stopped.load(Ordering::Acquire) && !is_pending(p, SIGCONT) {
            proc_yield();
        } else {
            for i in 0..SIG_SIZE as u32 {
                let handler = p.signal_handlers[i as usize].load(Ordering::Acquire);
                if handler == SIG_IGN || is_masked(p, i) || !is_pending(p, i) {
                    continue;
                }
                let staged_user_handler = if handler == SIG_DFL {
                    handle_kernel_signal(p, i);
                    false
                } else {
                    handle_user_signal(p, i, handler)
                };
                p.pending_signals.fetch_and(!(1 << i), Ordering::AcqRel);
                // The trap frame is now wired to the staged handler; further
                // dispatch in this pass would stomp on it.
                if staged_user_handler {
                    break;
                }
            }
        }
        if !p.sig_stopped.load(Ordering::Acquire) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CPUS;
    use crate::param::{SIGKILL, SIG_SIZE as SIGSZ};
    use crate::riscv::set_test_hart_id;

    fn bind_current(idx: usize) -> &'static super::super::Proc {
        let p = &PROCS.table[idx];
        let cpu = CPUS.current_raw();
        // SAFETY: test-only, single-threaded per hart id.
        unsafe { (*cpu).proc = p as *const _ };
        p
    }

    fn fresh_running(hart: usize) -> &'static super::super::Proc {
        set_test_hart_id(hart);
        let i = PROCS.allocproc().expect("slot available");
        let p = &PROCS.table[i];
        assert!(p.state.compare_exchange(Procstate::Embryo, Procstate::Running));
        bind_current(i)
    }

    fn release(p: &super::super::Proc) {
        p.pid.store(0, core::sync::atomic::Ordering::Relaxed);
        assert!(p.state.compare_exchange(Procstate::Running, Procstate::Unused));
    }

    #[test]
    fn kill_sets_pending_bit_and_rejects_bad_signum() {
        let p = fresh_running(20);
        let pid = p.pid();
        assert_eq!(kill(pid, (SIGSZ as u32) + 1), Err(KernelError::BadSignum));
        assert_eq!(kill(pid, 5), Ok(()));
        assert!(is_pending(p, 5));
        assert_eq!(kill(pid + 1000, 5), Err(KernelError::NoSuchProcess));
        release(p);
    }

    #[test]
    fn kill_sigstop_on_sleeping_is_dropped() {
        let p = fresh_running(21);
        assert!(p.state.compare_exchange(Procstate::Running, Procstate::Sleeping));
        let pid = p.pid();
        assert_eq!(kill(pid, SIGSTOP), Ok(()));
        assert!(!is_pending(p, SIGSTOP));
        assert!(p.state.compare_exchange(Procstate::Sleeping, Procstate::Running));
        release(p);
    }

    #[test]
    fn kill_twice_is_idempotent() {
        let p = fresh_running(22);
        let pid = p.pid();
        kill(pid, 7).unwrap();
        kill(pid, 7).unwrap();
        assert_eq!(
            p.pending_signals.load(Ordering::Relaxed) & (1 << 7),
            1 << 7
        );
        release(p);
    }

    #[test]
    fn sigprocmask_round_trips() {
        let p = fresh_running(23);
        let x = 0xAAAA_u32;
        sigprocmask(x);
        let y = sigprocmask(0x5555);
        sigprocmask(y);
        assert_eq!(p.signal_mask.load(Ordering::Relaxed), x);
        release(p);
    }

    #[test]
    fn signal_replaces_handler_and_returns_previous() {
        let p = fresh_running(24);
        let prev = signal(3, 0x4000).unwrap();
        assert_eq!(prev, SIG_DFL);
        let prev2 = signal(3, 0x5000).unwrap();
        assert_eq!(prev2, 0x4000);
        assert_eq!(signal(SIGSZ as u32, 1), Err(KernelError::BadSignum));
        release(p);
    }

    #[test]
    fn handle_signals_dispatches_kernel_default_sigstop_and_sigcont() {
        let p = fresh_running(25);
        // SAFETY: test-only, single owner.
        unsafe {
            p.tf_mut().epc = 0x1000;
        }
        kill(p.pid(), SIGSTOP).unwrap();
        handle_signals();
        assert!(p.sig_stopped.load(Ordering::Relaxed));

        kill(p.pid(), SIGCONT).unwrap();
        handle_signals();
        assert!(!p.sig_stopped.load(Ordering::Relaxed));
        release(p);
    }

    #[test]
    fn handle_signals_sets_killed_on_sigkill() {
        let p = fresh_running(26);
        unsafe {
            p.tf_mut().epc = 0x1000;
        }
        kill(p.pid(), SIGKILL).unwrap();
        handle_signals();
        assert!(p.is_killed());
        release(p);
    }

    #[test]
    fn handle_signals_stages_user_handler_and_sigret_restores() {
        let p = fresh_running(27);
        let mut mem = vm::setupkvm().unwrap();
        vm::inituvm(&mut mem, &[0u8; 16]).unwrap();
        let original_sp = mem.size();
        unsafe {
            *p.mem_mut() = Some(mem);
            let tf = p.tf_mut();
            tf.epc = 0x2000;
            tf.sp = original_sp;
        }
        signal(6, 0x9000).unwrap();
        kill(p.pid(), 6).unwrap();
        handle_signals();

        // SAFETY: test-only, single owner.
        unsafe {
            assert_eq!(p.tf_mut().epc, 0x9000);
            assert_ne!(p.tf_mut().sp, original_sp);
        }
        assert_eq!(p.signal_mask.load(Ordering::Relaxed), u32::MAX);

        sigret();
        unsafe {
            assert_eq!(p.tf_mut().epc, 0x2000);
            assert_eq!(p.tf_mut().sp, original_sp);
        }
        assert_eq!(p.signal_mask.load(Ordering::Relaxed), 0);

        unsafe {
            p.mem_mut().take();
        }
        release(p);
    }
}
