pub mod constants;
pub mod mem;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod startup {
    use argon_log::{println_debug, println_info};

    use super::constants::KERNEL_VBASE;
    use super::mem;
    use crate::arch::x86::multiboot::MbInfo;
    use slab_allocator::SlubFlags;

    /// Kernel entry point, called from the boot assembly with the physical
    /// address of the multiboot information structure.
    #[no_mangle]
    pub extern "C" fn startup(mb_info: u32) -> ! {
        crate::driver::serial::setup();
        println_info!("argon {} starting", env!("CARGO_PKG_VERSION"));

        let mb_info = unsafe { &mut *((mb_info as usize + KERNEL_VBASE) as *mut MbInfo) };

        mem::page::page_setup_from_mb(mb_info);
        mem::page_alloc::buddy_setup();
        mem::allocator::slub_setup();
        mem::allocator::malloc_setup();

        // Exercise the allocators once before anything depends on them.
        let cache = mem::allocator::create_cache("boot test", 16, 0, 0, SlubFlags::empty())
            .expect("failed to create the boot test cache");
        let obj = mem::allocator::slub_alloc(cache);
        println_debug!("slub test object at {:p}", obj);
        mem::allocator::slub_free(cache, obj);
        assert!(mem::allocator::destroy_cache(cache));

        let ptr = mem::allocator::kmalloc(56);
        println_debug!("kmalloc test object at {:p}", ptr);
        mem::allocator::kfree(ptr);

        println_info!("boot completed");
        mem::page::page_debug();
        crate::arch::x86::freeze();
    }
}
