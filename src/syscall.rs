//! System call argument parsing and dispatch.
//!
//! Mostly bookkeeping: pull arguments out of the trapping process's trap
//! frame, call into `sysproc`, and wire the result back into `a0`.

use log::warn;

use crate::proc::myproc;
use crate::sysproc;

/// Fetches the nth syscall argument as a 32-bit signed integer. This crate's
/// syscalls never take more than two arguments.
pub fn argint(n: usize) -> i32 {
    let p = myproc().expect("argint: no current process");
    p.syscall_arg(n) as i32
}

/// Fetches the nth syscall argument as a raw address/word-sized value.
pub fn argaddr(n: usize) -> usize {
    let p = myproc().expect("argaddr: no current process");
    p.syscall_arg(n)
}

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_KILL: usize = 6;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SIGNAL: usize = 30;
pub const SYS_SIGPROCMASK: usize = 31;
pub const SYS_SIGRET: usize = 32;

/// Dispatches the syscall named by the current process's trap frame, and
/// writes its return value into `a0`. Called by the trap path on a syscall
/// trap, before `proc::handle_signals` runs on the way back to user mode.
///
/// `sigret` is special: it overwrites the whole trap frame (`a0` included)
/// from the backup it restores, so its own "return value" must not then be
/// written over that restored `a0`.
pub fn syscall() {
    let p = myproc().expect("syscall: no current process");
    let num = p.syscall_num();
    if num == SYS_SIGRET {
        sysproc::sys_sigret();
        return;
    }
    let ret: isize = match num {
        SYS_FORK => sysproc::sys_fork(),
        SYS_EXIT => sysproc::sys_exit(),
        SYS_WAIT => sysproc::sys_wait(),
        SYS_KILL => sysproc::sys_kill(),
        SYS_GETPID => sysproc::sys_getpid(),
        SYS_SBRK => sysproc::sys_sbrk(),
        SYS_SIGNAL => sysproc::sys_signal(),
        SYS_SIGPROCMASK => sysproc::sys_sigprocmask(),
        _ => {
            warn!("pid {}: unknown syscall {}", p.pid(), num);
            -1
        }
    };
    p.set_syscall_ret(ret as usize);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CPUS;
    use crate::proc::{Procstate, PROCS};
    use crate::riscv::set_test_hart_id;

    #[test]
    fn sigret_dispatch_does_not_clobber_restored_a0() {
        set_test_hart_id(28);
        let i = PROCS.allocproc().expect("slot available");
        let p = &PROCS.table[i];
        assert!(p
            .state
            .compare_exchange(Procstate::Embryo, Procstate::Running));
        let cpu = CPUS.current_raw();
        // SAFETY: test-only, single-threaded per hart id.
        unsafe { (*cpu).proc = p as *const _ };

        let mut mem = crate::vm::setupkvm().unwrap();
        crate::vm::inituvm(&mut mem, &[0u8; 16]).unwrap();
        let original_sp = mem.size();
        let original_a0 = 0x1234;
        // SAFETY: test-only, single owner.
        unsafe {
            *p.mem_mut_for_test() = Some(mem);
            let tf = p.tf_mut_for_test();
            tf.epc = 0x1000;
            tf.sp = original_sp;
            tf.a0 = original_a0;
        }

        crate::proc::signal(4, 0x3000).unwrap();
        crate::proc::kill(p.pid(), 4).unwrap();
        crate::proc::handle_signals();
        // SAFETY: test-only, single owner.
        unsafe {
            assert_eq!(p.tf_mut_for_test().epc, 0x3000);
        }

        // SAFETY: test-only, single owner.
        unsafe {
            p.tf_mut_for_test().num = SYS_SIGRET as usize;
        }
        syscall();
        // SAFETY: test-only, single owner. If `syscall` wrote `sys_sigret`'s
        // own return value into `a0` after `sigret` restored it, this would
        // observe 0 instead of the original value.
        unsafe {
            let tf = p.tf_mut_for_test();
            assert_eq!(tf.a0, original_a0);
            assert_eq!(tf.sp, original_sp);
            assert_eq!(tf.epc, 0x1000);
        }
    }
}
