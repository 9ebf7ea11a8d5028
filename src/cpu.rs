//! Per-CPU state: the registry of `Cpu` records and the nestable
//! interrupt-disable helper (`push_off`/`pop_off`).

use core::cell::UnsafeCell;
use core::ptr;

use array_macro::array;

use crate::param::NCPU;
use crate::proc::{Context, Proc};
use crate::riscv::{cpuid, intr_get, intr_off, intr_on};

/// Per-CPU state.
pub struct Cpu {
    /// The process running on this cpu, or null.
    pub proc: *const Proc,

    /// swtch() here to enter scheduler().
    pub context: Context,

    /// Depth of push_off() nesting.
    noff: u32,

    /// Were interrupts enabled before the outermost push_off()?
    interrupt_enabled: bool,

    /// This hart's simulated interrupt-enable bit (stands in for the
    /// `sstatus.SIE` CSR, which is per-hart hardware).
    live_intr_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: ptr::null(),
            context: Context::new(),
            noff: 0,
            interrupt_enabled: false,
            live_intr_enabled: true,
        }
    }

    /// This hart's simulated `sstatus.SIE` bit.
    pub(crate) fn live_intr_enabled(&self) -> bool {
        self.live_intr_enabled
    }

    pub(crate) fn set_live_intr_enabled(&mut self, v: bool) {
        self.live_intr_enabled = v;
    }

    /// Current `push_off` nesting depth.
    pub(crate) fn noff(&self) -> u32 {
        self.noff
    }

    /// The interrupt-enable state saved by the outermost `push_off`. Only
    /// meaningful while `noff() > 0`.
    pub(crate) fn interrupt_enabled(&self) -> bool {
        self.interrupt_enabled
    }

    /// Overwrites the saved interrupt-enable state. Used by `sched` to save
    /// and restore it across a `swtch`, since it is a property of the
    /// process being switched away from, not of the CPU itself.
    pub(crate) fn set_interrupt_enabled(&mut self, v: bool) {
        self.interrupt_enabled = v;
    }
}

/// The per-CPU registry, one slot per possible hart.
///
/// Each hart only ever touches its own slot (identified by `cpuid()`), so
/// sharing this across harts via a plain `UnsafeCell` array is sound.
pub struct Cpus([UnsafeCell<Cpu>; NCPU]);

// SAFETY: a hart only accesses the `Cpu` at its own `cpuid()` index.
unsafe impl Sync for Cpus {}

impl Cpus {
    pub const fn new() -> Self {
        Self(array![_ => UnsafeCell::new(Cpu::new()); NCPU])
    }

    /// Returns a raw pointer to the current hart's `Cpu`.
    ///
    /// Safe to call with interrupts enabled, but the scheduler may move this
    /// process to a different CPU the moment interrupts are re-enabled, so
    /// the pointer should not be retained across a yield point.
    pub fn current_raw(&self) -> *mut Cpu {
        self.0[cpuid()].get()
    }
}

impl Default for Cpus {
    fn default() -> Self {
        Self::new()
    }
}

pub static CPUS: Cpus = Cpus::new();

/// push_off/pop_off are like intr_off()/intr_on() except that they nest:
/// it takes two pop_off()s to undo two push_off()s. If interrupts were
/// already off when push_off() was first called, pop_off() leaves them off.
pub fn push_off() {
    let old = intr_get();
    // SAFETY: paired with intr_on() in pop_off() once nesting unwinds.
    unsafe { intr_off() };

    let cpu = CPUS.current_raw();
    // SAFETY: only this hart touches its own Cpu slot.
    unsafe {
        if (*cpu).noff == 0 {
            (*cpu).interrupt_enabled = old;
        }
        (*cpu).noff += 1;
    }
}

/// pop_off() should be paired with push_off(). See push_off() for details.
pub fn pop_off() {
    assert!(!intr_get(), "pop_off - interruptible");
    let cpu = CPUS.current_raw();
    // SAFETY: only this hart touches its own Cpu slot.
    unsafe {
        assert!((*cpu).noff >= 1, "pop_off");
        (*cpu).noff -= 1;
        if (*cpu).noff == 0 && (*cpu).interrupt_enabled {
            intr_on();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_push_pop_leaves_interrupts_as_found() {
        crate::riscv::set_test_hart_id(1);
        unsafe { intr_on() };
        push_off();
        push_off();
        assert!(!intr_get());
        pop_off();
        assert!(!intr_get());
        pop_off();
        assert!(intr_get());
    }
}
