//! Kernel/user trap entry.
//!
//! Real CSR decoding, the trampoline page and device interrupts are
//! hardware/boot-code concerns out of scope here. What's left is the shape
//! the scheduling core's invariants actually depend on: a syscall trap is
//! dispatched through `syscall::syscall`, and every return to user mode — a
//! syscall trap or otherwise — runs `proc::handle_signals` first.

use log::warn;

use crate::proc;
use crate::syscall;

/// Entry point for a trap taken from user mode. `is_syscall` distinguishes
/// an `ecall` trap from any other user-mode trap (page fault, illegal
/// instruction, ...), which this crate only needs to treat as fatal.
pub fn usertrap(is_syscall: bool) {
    let p = match proc::myproc() {
        Some(p) => p,
        None => return,
    };
    if is_syscall {
        syscall::syscall();
    } else {
        warn!("pid {}: unhandled user trap, killing", p.pid());
        p.set_killed();
    }
    usertrapret();
}

/// Runs just before control returns to user mode: delivers any pending
/// signals, possibly rewriting the trap frame to enter a user handler.
pub fn usertrapret() {
    proc::handle_signals();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::{Procstate, PROCS};
    use crate::riscv::set_test_hart_id;

    #[test]
    fn usertrap_on_bad_trap_kills_the_process() {
        set_test_hart_id(30);
        let i = PROCS.allocproc().expect("slot available");
        let p = &PROCS.table[i];
        assert!(p
            .state
            .compare_exchange(Procstate::Embryo, Procstate::Running));
        let cpu = crate::cpu::CPUS.current_raw();
        // SAFETY: test-only, single-threaded per hart id.
        unsafe { (*cpu).proc = p as *const _ };

        usertrap(false);
        assert!(p.is_killed());
    }
}
