use core::ptr::NonNull;

use argon_mm::address::PAddr;
use argon_mm::phys::PhysAccess;

use crate::kernel::constants::{KERNEL_MAX_PAGE, KERNEL_VBASE};

/// The fixed identity-plus-offset direct map of the first gigabyte of
/// physical memory, established by the boot assembly.
pub struct DirectPhysAccess;

impl PhysAccess for DirectPhysAccess {
    unsafe fn as_ptr<T>(paddr: PAddr) -> NonNull<T> {
        assert!(
            paddr.addr() < KERNEL_MAX_PAGE,
            "{paddr:?} is beyond the kernel direct map"
        );

        unsafe { NonNull::new_unchecked((paddr.addr() + KERNEL_VBASE) as *mut T) }
    }

    unsafe fn from_ptr<T>(ptr: NonNull<T>) -> PAddr {
        let addr = ptr.as_ptr() as usize;
        assert!(
            addr >= KERNEL_VBASE,
            "pointer {addr:#x} is below the kernel direct map"
        );

        PAddr::from(addr - KERNEL_VBASE)
    }
}
