use core::ptr::NonNull;

use argon_log::println_warn;
use argon_mm::paging::BlockAlloc;
use argon_mm::phys::PhysAccess;

use crate::{CachePtr, SlubFlags, SlubHeap};

/// Number of size buckets: 16, 32, .. 4096 bytes.
pub const BUCKET_COUNT: usize = 9;

const fn bucket_size(index: usize) -> usize {
    16 << index
}

/// The size-bucketed general-purpose allocator behind `kmalloc`.
///
/// Requests are served from the smallest bucket cache whose object size
/// covers them; anything above one page is refused.
pub struct BucketAllocator {
    caches: [Option<CachePtr>; BUCKET_COUNT],
}

// SAFETY: The bucket table holds bare cache handles; the global instance
// sits behind a spinlock and is only driven from the single kernel CPU.
unsafe impl Send for BucketAllocator {}

impl BucketAllocator {
    pub const fn new() -> Self {
        Self {
            caches: [None; BUCKET_COUNT],
        }
    }

    /// Create the bucket caches. Panics on out-of-memory; a kernel without
    /// a general-purpose allocator cannot continue.
    pub fn setup<A: BlockAlloc, P: PhysAccess>(&mut self, heap: &mut SlubHeap<A, P>) {
        for (index, slot) in self.caches.iter_mut().enumerate() {
            let size = bucket_size(index);
            let cache = heap
                .create_cache("malloc", size as u16, 0, 0, SlubFlags::empty())
                .unwrap_or_else(|| panic!("failed to create the malloc cache for size {size}"));

            *slot = Some(cache);
        }
    }

    pub fn alloc<A: BlockAlloc, P: PhysAccess>(
        &self,
        heap: &mut SlubHeap<A, P>,
        size: usize,
    ) -> *mut u8 {
        for (index, cache) in self.caches.iter().enumerate() {
            if size <= bucket_size(index) {
                let cache = cache.expect("bucket allocator not set up");
                return heap
                    .alloc(cache)
                    .map_or(core::ptr::null_mut(), NonNull::as_ptr);
            }
        }

        println_warn!("kmalloc() does not support allocations larger than a page");
        core::ptr::null_mut()
    }

    /// Free a pointer previously returned by [`BucketAllocator::alloc`].
    /// The owning cache is recovered from the frame's slab cookie; null and
    /// foreign pointers are ignored with a warning.
    pub fn free<A: BlockAlloc, P: PhysAccess>(&self, heap: &mut SlubHeap<A, P>, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        match SlubHeap::<A, P>::cache_of(ptr) {
            Some(cache) => heap.free(cache, ptr.as_ptr()),
            None => println_warn!("kfree(): {:p} does not belong to any slab", ptr.as_ptr()),
        }
    }
}
