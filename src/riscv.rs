//! Minimal hardware primitives.
//!
//! A real rv6 reads `mstatus`/`sstatus` CSRs and `mhartid` with inline
//! assembly. None of that hardware exists here: interrupt-enable state is
//! modeled as a per-hart flag on `Cpu` (standing in for the per-hart
//! `sstatus.SIE` bit), and the current hart id is a per-host-thread value so
//! that unit tests can pretend to run on several CPUs at once.

use crate::cpu::CPUS;

/// Are interrupts currently enabled on this (simulated) hart?
pub fn intr_get() -> bool {
    let cpu = CPUS.current_raw();
    // SAFETY: only this hart touches its own Cpu slot.
    unsafe { (*cpu).live_intr_enabled() }
}

/// Enable interrupts.
///
/// # Safety
///
/// Caller must not hold a lock that assumes interrupts stay disabled.
pub unsafe fn intr_on() {
    let cpu = CPUS.current_raw();
    (*cpu).set_live_intr_enabled(true);
}

/// Disable interrupts.
///
/// # Safety
///
/// Must be paired with a later `intr_on`, directly or via `push_off`/`pop_off`.
pub unsafe fn intr_off() {
    let cpu = CPUS.current_raw();
    (*cpu).set_live_intr_enabled(false);
}

#[cfg(not(test))]
/// Which hart (core) is this? Single-hart stand-in outside of tests.
pub fn lapicid() -> usize {
    0
}

#[cfg(test)]
thread_local! {
    static TEST_HART_ID: core::cell::Cell<usize> = const { core::cell::Cell::new(0) };
}

#[cfg(test)]
/// Which hart (core) is this? Each host test thread gets its own id so that
/// `cpuid()`-keyed state (the per-CPU registry) behaves as if each test
/// thread were a distinct CPU.
pub fn lapicid() -> usize {
    TEST_HART_ID.with(|c| c.get())
}

#[cfg(test)]
/// Assigns this host thread the given simulated hart id.
pub fn set_test_hart_id(id: usize) {
    TEST_HART_ID.with(|c| c.set(id));
}

/// Return this CPU's id.
pub fn cpuid() -> usize {
    lapicid()
}
