use core::ptr::NonNull;

use crate::address::PAddr;

/// Translation between physical addresses and kernel-accessible pointers.
///
/// The kernel implements this with the fixed higher-half direct map; host
/// tests implement it over a synthetic arena.
pub trait PhysAccess {
    /// Translate a physical address into a kernel accessible pointer. Use
    /// it with care.
    ///
    /// # Panic
    /// If the address lies outside the direct-mapped physical range.
    ///
    /// # Safety
    /// The caller must ensure that the data at `paddr` is of type `T`.
    /// Otherwise, it may lead to undefined behavior.
    unsafe fn as_ptr<T>(paddr: PAddr) -> NonNull<T>;

    /// Translate a kernel accessible pointer back into a physical address.
    ///
    /// # Panic
    /// If the pointer does not lie inside the direct map.
    ///
    /// # Safety
    /// The caller must ensure that the pointer was obtained from
    /// [`PhysAccess::as_ptr`] or otherwise points into the direct map.
    unsafe fn from_ptr<T>(ptr: NonNull<T>) -> PAddr;
}
