use core::ptr::NonNull;

/// A provider of contiguous page blocks, addressed by kernel-virtual
/// pointers.
///
/// The slab layer consumes its backing memory through this trait so that it
/// can be stacked on the global buddy allocator in the kernel and on a
/// private one in host tests.
pub trait BlockAlloc {
    /// Allocate a block of at least `count` contiguous pages; any pages
    /// beyond `count` are returned to the allocator before this call
    /// completes. `None` on exhaustion.
    fn alloc_exact(&self, count: usize) -> Option<NonNull<u8>>;

    /// Release a block previously obtained from [`BlockAlloc::alloc_exact`]
    /// with the same `count`.
    ///
    /// # Safety
    /// `ptr` must come from `alloc_exact(count)` on this allocator and must
    /// not be used afterwards.
    unsafe fn free_exact(&self, ptr: NonNull<u8>, count: usize);
}
