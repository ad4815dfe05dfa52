//! The global object allocator and `kmalloc`.

use core::ptr::NonNull;

use argon_sync::Spin;
use slab_allocator::{BucketAllocator, CachePtr, SlubFlags, SlubHeap};

use super::page_alloc::GlobalBuddy;
use super::phys::DirectPhysAccess;

static SLUB: Spin<SlubHeap<GlobalBuddy, DirectPhysAccess>> = Spin::new(SlubHeap::new(GlobalBuddy));
static BUCKETS: Spin<BucketAllocator> = Spin::new(BucketAllocator::new());

/// Bootstrap the slub allocator. Must run after
/// [`buddy_setup`](super::page_alloc::buddy_setup).
pub fn slub_setup() {
    SLUB.lock().setup();
}

/// Create the `kmalloc` bucket caches. Must run after [`slub_setup`].
pub fn malloc_setup() {
    BUCKETS.lock().setup(&mut SLUB.lock());
}

pub fn create_cache(
    name: &'static str,
    obj_size: u16,
    obj_align: u16,
    min_free: u16,
    flags: SlubFlags,
) -> Option<CachePtr> {
    SLUB.lock().create_cache(name, obj_size, obj_align, min_free, flags)
}

pub fn destroy_cache(cache: CachePtr) -> bool {
    SLUB.lock().destroy_cache(cache)
}

pub fn slub_alloc(cache: CachePtr) -> *mut u8 {
    SLUB.lock()
        .alloc(cache)
        .map_or(core::ptr::null_mut(), NonNull::as_ptr)
}

pub fn slub_free(cache: CachePtr, ptr: *mut u8) {
    SLUB.lock().free(cache, ptr)
}

/// Allocate `size` bytes, 8-byte aligned, from the smallest covering
/// bucket. Null for requests above one page.
pub fn kmalloc(size: usize) -> *mut u8 {
    BUCKETS.lock().alloc(&mut SLUB.lock(), size)
}

/// Free a pointer returned by [`kmalloc`]. Null is ignored.
pub fn kfree(ptr: *mut u8) {
    BUCKETS.lock().free(&mut SLUB.lock(), ptr)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod global {
    use core::alloc::{GlobalAlloc, Layout};

    use super::{kfree, kmalloc};

    struct Allocator;

    // Bucket objects are aligned to their own (power-of-two) size, so
    // serving `max(size, align)` satisfies any layout a bucket can cover.
    unsafe impl GlobalAlloc for Allocator {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            kmalloc(layout.size().max(layout.align()))
        }

        unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
            kfree(ptr)
        }
    }

    #[global_allocator]
    static ALLOCATOR: Allocator = Allocator;
}
