//! Minimal 16550a UART output primitive.
//!
//! Only synchronous single-character output is kept: it exists purely to
//! give the ambient logger somewhere to write bytes. Input handling, the
//! transmit ring buffer and the UART interrupt path are the console/CLI
//! printing machinery that is out of scope for this subsystem.

#[cfg(not(test))]
const UART0: usize = 0x1000_0000;

#[cfg(not(test))]
const LSR_OFFSET: usize = 5;
#[cfg(not(test))]
const LSR_TX_IDLE: u8 = 1 << 5;

/// Writes one byte to the UART, spinning until the transmit holding
/// register is idle. Safe to call from within a panic handler.
#[cfg(not(test))]
pub fn putc_sync(c: u8) {
    use core::ptr::{read_volatile, write_volatile};
    unsafe {
        while read_volatile((UART0 + LSR_OFFSET) as *const u8) & LSR_TX_IDLE == 0 {}
        write_volatile(UART0 as *mut u8, c);
    }
}

#[cfg(test)]
thread_local! {
    static TEST_OUTPUT: std::cell::RefCell<std::vec::Vec<u8>> =
        std::cell::RefCell::new(std::vec::Vec::new());
}

#[cfg(test)]
pub fn putc_sync(c: u8) {
    TEST_OUTPUT.with(|buf| buf.borrow_mut().push(c));
}

#[cfg(test)]
pub fn test_output() -> std::vec::Vec<u8> {
    TEST_OUTPUT.with(|buf| buf.borrow().clone())
}
