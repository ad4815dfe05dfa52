//! The global buddy allocator instance.

use core::ptr::NonNull;

use argon_mm::paging::BlockAlloc;
use argon_sync::Spin;
use buddy_allocator::BuddyAllocator;

use super::phys::DirectPhysAccess;

static BUDDY: Spin<BuddyAllocator<DirectPhysAccess>> = Spin::new(BuddyAllocator::new());

/// Seed the buddy allocator from the frame table. Must run after
/// [`page_setup`](super::page::page_setup).
pub fn buddy_setup() {
    BUDDY.lock().setup();
}

/// Allocate a block of 2^`order` pages from the global buddy allocator.
pub fn alloc_pages(order: u32) -> Option<NonNull<u8>> {
    BUDDY.lock().alloc(order)
}

/// Free a block obtained from [`alloc_pages`] at the same order.
pub fn free_pages(ptr: *mut u8, order: u32) {
    BUDDY.lock().free(ptr, order)
}

pub fn free_page_count() -> usize {
    BUDDY.lock().free_page_count()
}

pub fn buddy_dump() {
    BUDDY.lock().dump()
}

/// Handle to the global buddy allocator, for layering the slab allocator
/// on top of it.
#[derive(Clone)]
pub struct GlobalBuddy;

impl BlockAlloc for GlobalBuddy {
    fn alloc_exact(&self, count: usize) -> Option<NonNull<u8>> {
        BUDDY.lock().alloc_exact(count)
    }

    unsafe fn free_exact(&self, ptr: NonNull<u8>, count: usize) {
        BUDDY.lock().free_exact(ptr.as_ptr(), count)
    }
}
