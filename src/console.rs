//! The kernel's sole output sink: a `core::fmt::Write` wrapper around the
//! UART, a `print!`/`println!` pair built on it, and a `log::Log`
//! implementation so kernel code reaches for `log::info!`/`log::warn!` the
//! way the rest of the ambient stack expects.

use core::fmt;

use crate::lock::RawSpinlock;
use crate::uart;

struct Console;

static CONSOLE_LOCK: RawSpinlock = RawSpinlock::new("console");

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            uart::putc_sync(b);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
    use fmt::Write;
    CONSOLE_LOCK.acquire();
    let _ = Console.write_fmt(args);
    CONSOLE_LOCK.release();
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => { $crate::print!("\n") };
    ($($arg:tt)*) => {
        $crate::console::_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            _print(format_args!(
                "[{:>5}] {}\n",
                record.level(),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

/// Installs the kernel console as the global `log` backend. Call once during
/// boot, before any other CPU is brought up.
pub fn init() {
    log::set_max_level(log::LevelFilter::Trace);
    // Only fails if called twice; a double call during boot is a kernel bug.
    log::set_logger(&LOGGER).expect("console::init called more than once");
}
