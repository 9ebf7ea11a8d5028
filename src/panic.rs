//! Panic handler: logs the panic through the console and halts.

#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    log::error!("{}", info);
    loop {
        core::hint::spin_loop();
    }
}
