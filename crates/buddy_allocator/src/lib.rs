#![no_std]

//! Power-of-two page block allocator.
//!
//! Fifteen free areas hold blocks of 2^0 .. 2^14 pages. Every block of
//! order `k` starts at a PFN that is a multiple of 2^k, so the buddy of a
//! block is found by flipping one bit of its physical address. Free blocks
//! store their own list node in their first bytes; the allocator never
//! touches a free block's memory beyond that header.

#[cfg(test)]
extern crate std;

mod free_area;

use core::marker::PhantomData;
use core::ptr::NonNull;

use argon_log::{println_debug, println_warn};
use argon_mm::address::PAddr;
use argon_mm::frame::{self, FrameFlags};
use argon_mm::paging::{PAGE_SIZE, PFN};
use argon_mm::phys::PhysAccess;

pub use free_area::FreeArea;

/// Largest supported block order (2^14 pages, 64 MiB).
pub const MAX_ORDER: u32 = 14;

const AREA_COUNT: usize = MAX_ORDER as usize + 1;

pub struct BuddyAllocator<P: PhysAccess> {
    areas: [FreeArea; AREA_COUNT],
    /// False during the seed pass, where freeing an already-`FREE` frame is
    /// how memory enters the allocator. Afterwards it is a double free.
    initialized: bool,
    _phys: PhantomData<P>,
}

impl<P: PhysAccess> BuddyAllocator<P> {
    pub const fn new() -> Self {
        Self {
            areas: [const { FreeArea::new() }; AREA_COUNT],
            initialized: false,
            _phys: PhantomData,
        }
    }

    /// Populate the free areas from the frame table: every `FREE` frame is
    /// fed in as an order-0 block and coalesces upward naturally.
    pub fn setup(&mut self) {
        assert!(!self.initialized, "buddy allocator set up twice");

        for pfn in 0..frame::frame_count() {
            let Some(frame) = frame::pfn_info(PFN::from(pfn)) else {
                break;
            };

            if frame.has(FrameFlags::FREE) {
                let ptr = unsafe { P::as_ptr::<u8>(frame.paddr()) };
                self.free(ptr.as_ptr(), 0);
            }
        }

        self.initialized = true;
    }

    /// Free a block of 2^`order` pages previously returned by
    /// [`BuddyAllocator::alloc`] at the same order. A null `ptr` is a no-op.
    ///
    /// # Panics
    /// On a misaligned base, on a reserved or poisoned frame, and on a
    /// double free once the allocator is initialized.
    pub fn free(&mut self, ptr: *mut u8, order: u32) {
        let Some(base) = NonNull::new(ptr) else {
            return;
        };
        assert!(order <= MAX_ORDER, "buddy_free(): order {order} out of range");

        let pbase = unsafe { P::from_ptr(base) };
        if !pbase.is_page_aligned() {
            panic!("buddy_free(): unaligned block address {pbase:?}");
        }

        for i in 0..(1usize << order) {
            let frame = frame::info(pbase + i * PAGE_SIZE)
                .expect("buddy_free(): block past the end of physical memory");

            assert!(
                !frame.has(FrameFlags::RESERVED),
                "buddy_free(): trying to free a reserved page"
            );
            assert!(
                !frame.has(FrameFlags::POISONED),
                "buddy_free(): trying to free a poisoned page"
            );
            if self.initialized {
                assert!(
                    !frame.has(FrameFlags::FREE),
                    "buddy_free(): double free detected"
                );
            }

            frame.remove_flags(FrameFlags::KERNEL | FrameFlags::BUDDY);
            frame.insert_flags(FrameFlags::FREE);
            frame.set_order(0);
        }

        let mut head_pa = pbase;
        let mut head = frame::info(head_pa).unwrap();
        head.set_order(order as u8);
        head.insert_flags(FrameFlags::BUDDY);

        // Coalesce with the buddy block until it is missing, busy, of a
        // different order, or the block has reached the maximum order.
        while (head.order() as u32) < MAX_ORDER {
            let order = head.order() as u32;
            let buddy_pa = PAddr::from(head_pa.addr() ^ (PAGE_SIZE << order));

            let Some(buddy) = frame::info(buddy_pa) else {
                break;
            };
            if !buddy.has(FrameFlags::FREE) || !buddy.has(FrameFlags::BUDDY) {
                break;
            }
            if buddy.order() as u32 != order {
                break;
            }

            unsafe { self.areas[order as usize].remove(P::as_ptr::<u8>(buddy_pa)) };
            buddy.remove_flags(FrameFlags::BUDDY);
            buddy.set_order(0);

            // The lower-addressed half heads the coalesced block.
            if buddy_pa < head_pa {
                head.remove_flags(FrameFlags::BUDDY);
                head.set_order(0);
                head_pa = buddy_pa;
                head = buddy;
            }
            head.insert_flags(FrameFlags::BUDDY);
            head.set_order((order + 1) as u8);
        }

        let order = head.order() as u32;
        unsafe { self.areas[order as usize].push(P::as_ptr::<u8>(head_pa)) };
    }

    /// Allocate a block of 2^`order` pages. Returns `None` with a warning
    /// when no block of sufficient order is free.
    ///
    /// The head frame's stored order is cleared; the caller must remember
    /// the order it asked for and pass it back to [`BuddyAllocator::free`].
    ///
    /// # Panics
    /// If `order` exceeds [`MAX_ORDER`].
    pub fn alloc(&mut self, order: u32) -> Option<NonNull<u8>> {
        assert!(order <= MAX_ORDER, "buddy_alloc(): order {order} out of range");

        let Some((block, found_order)) = (order..=MAX_ORDER)
            .find_map(|k| self.areas[k as usize].pop().map(|block| (block, k)))
        else {
            println_warn!("buddy_alloc(): cannot allocate block of order {}", order);
            return None;
        };

        let pbase = unsafe { P::from_ptr(block) };

        // Split the block back down to the requested order, giving the
        // upper half back one order at a time.
        for j in (order..found_order).rev() {
            let upper_pa = PAddr::from(pbase.addr() ^ (PAGE_SIZE << j));
            unsafe { self.areas[j as usize].push(P::as_ptr::<u8>(upper_pa)) };

            let upper = frame::info(upper_pa).unwrap();
            upper.set_order(j as u8);
            upper.insert_flags(FrameFlags::BUDDY);
        }

        for i in 0..(1usize << order) {
            let frame = frame::info(pbase + i * PAGE_SIZE).unwrap();

            assert!(
                !frame.has(FrameFlags::RESERVED)
                    && !frame.has(FrameFlags::POISONED)
                    && !frame.has(FrameFlags::KERNEL),
                "buddy_alloc(): claimed block has a non-free page"
            );
            assert!(frame.has(FrameFlags::FREE), "buddy_alloc(): page not free");

            frame.remove_flags(FrameFlags::FREE);
            frame.set_order(0);
        }

        Some(block)
    }

    /// Allocate at least `count` contiguous pages, returning the extra tail
    /// pages of the covering power-of-two block before handing the block
    /// out.
    pub fn alloc_exact(&mut self, count: usize) -> Option<NonNull<u8>> {
        assert!(count > 0);

        let order = count.next_power_of_two().trailing_zeros();
        let block = self.alloc(order)?;

        for i in count..(1usize << order) {
            self.free(unsafe { block.as_ptr().add(i * PAGE_SIZE) }, 0);
        }

        Some(block)
    }

    /// Free a block obtained from [`BuddyAllocator::alloc_exact`] with the
    /// same `count`: the largest aligned block first, then one page per
    /// remainder.
    pub fn free_exact(&mut self, ptr: *mut u8, count: usize) {
        if ptr.is_null() {
            return;
        }
        assert!(count > 0);

        let order = count.ilog2();
        self.free(ptr, order);

        for i in (1usize << order)..count {
            self.free(unsafe { ptr.add(i * PAGE_SIZE) }, 0);
        }
    }

    /// Total number of pages currently on the free lists.
    pub fn free_page_count(&self) -> usize {
        self.areas
            .iter()
            .enumerate()
            .map(|(order, area)| area.block_count() << order)
            .sum()
    }

    pub fn block_count(&self, order: u32) -> usize {
        self.areas[order as usize].block_count()
    }

    pub fn free_blocks(&self, order: u32) -> impl Iterator<Item = NonNull<u8>> + '_ {
        self.areas[order as usize].blocks()
    }

    pub fn dump(&self) {
        for (order, area) in self.areas.iter().enumerate() {
            if area.block_count() == 0 {
                continue;
            }

            println_debug!("bucket #{} ({} KiB blocks):", order, 4usize << order);
            for block in area.blocks() {
                println_debug!("  - block {:p}-{:p}", block.as_ptr(), unsafe {
                    block.as_ptr().add(PAGE_SIZE << order)
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon_mm::sim::{SimMachine, SimPhys};
    use std::vec::Vec;

    const PAGES: usize = 64;

    fn fresh() -> (SimMachine, BuddyAllocator<SimPhys>) {
        let machine = SimMachine::with_free_frames(PAGES);
        let mut buddy = BuddyAllocator::<SimPhys>::new();
        buddy.setup();
        (machine, buddy)
    }

    #[test]
    fn setup_coalesces_to_one_block() {
        let (_machine, buddy) = fresh();

        assert_eq!(buddy.free_page_count(), PAGES);
        assert_eq!(buddy.block_count(6), 1);
        for order in 0..6 {
            assert_eq!(buddy.block_count(order), 0);
        }
    }

    #[test]
    fn free_lists_stay_aligned_and_disjoint() {
        let (_machine, mut buddy) = fresh();

        // Churn the lists a little before checking.
        let a = buddy.alloc(0).unwrap();
        let b = buddy.alloc(2).unwrap();
        let c = buddy.alloc(1).unwrap();
        buddy.free(a.as_ptr(), 0);
        buddy.free(b.as_ptr(), 2);

        let mut seen = Vec::new();
        for order in 0..=MAX_ORDER {
            for block in buddy.free_blocks(order) {
                let pa = unsafe { SimPhys::from_ptr(block) };
                let pfn = usize::from(PFN::from(pa));
                assert_eq!(pfn % (1 << order), 0, "block misaligned for its order");

                let head = frame::info(pa).unwrap();
                assert_eq!(head.order() as u32, order);
                assert!(head.has(FrameFlags::FREE | FrameFlags::BUDDY));

                assert!(!seen.contains(&pfn), "block on two free lists");
                seen.push(pfn);
            }
        }

        buddy.free(c.as_ptr(), 1);
    }

    #[test]
    fn alloc_free_round_trip_restores_counts() {
        let (_machine, mut buddy) = fresh();
        let before = buddy.free_page_count();

        let a = buddy.alloc(0).unwrap();
        let b = buddy.alloc(3).unwrap();
        let c = buddy.alloc(1).unwrap();
        assert_eq!(buddy.free_page_count(), before - 1 - 8 - 2);

        buddy.free(b.as_ptr(), 3);
        buddy.free(a.as_ptr(), 0);
        buddy.free(c.as_ptr(), 1);

        assert_eq!(buddy.free_page_count(), before);
        // Coalescing completeness: everything merges back into the single
        // top block.
        assert_eq!(buddy.block_count(6), 1);
    }

    #[test]
    fn buddies_coalesce_on_free() {
        let (_machine, mut buddy) = fresh();

        let a = buddy.alloc(0).unwrap();
        let b = buddy.alloc(0).unwrap();

        // Splitting [0, 64) down to order 0 leaves pages 0 and 1 as the
        // first two singles, which are buddies of each other.
        let a_pfn = usize::from(PFN::from(unsafe { SimPhys::from_ptr(a) }));
        let b_pfn = usize::from(PFN::from(unsafe { SimPhys::from_ptr(b) }));
        assert_eq!(a_pfn ^ b_pfn, 1);

        buddy.free(b.as_ptr(), 0);
        assert_eq!(buddy.block_count(0), 1);

        buddy.free(a.as_ptr(), 0);
        // The pair merged and the merges cascaded all the way back up.
        assert_eq!(buddy.block_count(0), 0);
        assert_eq!(buddy.block_count(6), 1);
        assert_eq!(buddy.free_page_count(), PAGES);
    }

    #[test]
    fn allocated_frames_lose_their_type() {
        let (_machine, mut buddy) = fresh();

        let ptr = buddy.alloc(0).unwrap();
        let frame = frame::info(unsafe { SimPhys::from_ptr(ptr) }).unwrap();
        assert!(!frame.has(FrameFlags::FREE));
        assert!(!frame.flags().intersects(FrameFlags::TYPE_MASK));

        buddy.free(ptr.as_ptr(), 0);
        let frame = frame::info(unsafe { SimPhys::from_ptr(ptr) }).unwrap();
        assert!(frame.has(FrameFlags::FREE));
    }

    #[test]
    fn exact_allocation_round_trips() {
        let (_machine, mut buddy) = fresh();
        let before = buddy.free_page_count();

        let block = buddy.alloc_exact(5).unwrap();
        assert_eq!(buddy.free_page_count(), before - 5);

        buddy.free_exact(block.as_ptr(), 5);
        assert_eq!(buddy.free_page_count(), before);
        assert_eq!(buddy.block_count(6), 1);
    }

    #[test]
    fn exhaustion_returns_none() {
        let _machine = SimMachine::with_free_frames(4);
        let mut buddy = BuddyAllocator::<SimPhys>::new();
        buddy.setup();

        assert!(buddy.alloc(3).is_none());
        assert!(buddy.alloc(2).is_some());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let (_machine, mut buddy) = fresh();

        let ptr = buddy.alloc(0).unwrap();
        buddy.free(ptr.as_ptr(), 0);
        buddy.free(ptr.as_ptr(), 0);
    }

    #[test]
    #[should_panic(expected = "unaligned")]
    fn misaligned_free_panics() {
        let (_machine, mut buddy) = fresh();

        let ptr = buddy.alloc(0).unwrap();
        buddy.free(unsafe { ptr.as_ptr().add(1) }, 0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn oversized_order_panics() {
        let (_machine, mut buddy) = fresh();
        buddy.alloc(MAX_ORDER + 1);
    }

    #[test]
    fn null_free_is_a_no_op() {
        let (_machine, mut buddy) = fresh();
        let before = buddy.free_page_count();
        buddy.free(core::ptr::null_mut(), 0);
        assert_eq!(buddy.free_page_count(), before);
    }
}
