pub mod multiboot;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod boot;

/// Mask interrupts and halt forever.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn freeze() -> ! {
    loop {
        unsafe { core::arch::asm!("cli", "hlt", options(nomem, nostack)) };
    }
}
