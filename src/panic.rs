use argon_log::println_fatal;

/// Panic is terminal: report on the console and freeze the CPU. The
/// allocators panic on contract violations (double frees, corrupted free
/// lists), and a kernel with a corrupted allocator cannot continue.
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println_fatal!("kernel panic: {}", info);
    crate::arch::x86::freeze();
}
