use core::ptr::NonNull;

use intrusive_list::{Link, List, container_of};

/// Free-list node living in the first bytes of the free block it describes.
/// The node is only valid while the block is free; allocation hands the
/// bytes back to the caller and the node with them.
pub(crate) struct BuddyBlock {
    link: Link,
}

/// One bucket of the buddy allocator: the free blocks of a single order.
pub struct FreeArea {
    list: List,
}

// SAFETY: The free areas live behind the global allocator lock and are
// only touched from the single kernel CPU.
unsafe impl Send for FreeArea {}

impl FreeArea {
    pub const fn new() -> Self {
        Self { list: List::new() }
    }

    pub fn block_count(&self) -> usize {
        self.list.len()
    }

    /// Write a fresh node over `base` and insert it at the head.
    ///
    /// # Safety
    /// `base` must point to an unused block of this area's size, not linked
    /// anywhere else.
    pub(crate) unsafe fn push(&mut self, base: NonNull<u8>) {
        let block = base.cast::<BuddyBlock>();
        unsafe {
            block.write(BuddyBlock { link: Link::new() });
            self.list.push_front(&mut (*block.as_ptr()).link);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<NonNull<u8>> {
        self.list
            .pop_front()
            .map(|link| unsafe { container_of!(link.as_ptr(), BuddyBlock, link) }.cast())
    }

    /// Unlink the block starting at `base`.
    ///
    /// # Safety
    /// `base` must be the start of a block currently linked into this area.
    pub(crate) unsafe fn remove(&mut self, base: NonNull<u8>) {
        let block = base.cast::<BuddyBlock>();
        unsafe { self.list.remove(&mut (*block.as_ptr()).link) };
    }

    pub fn blocks(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        self.list
            .iter()
            .map(|link| unsafe { container_of!(link.as_ptr(), BuddyBlock, link) }.cast())
    }
}
