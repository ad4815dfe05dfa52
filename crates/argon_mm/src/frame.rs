//! The page frame table.
//!
//! One [`Frame`] descriptor per 4 KiB physical frame, in a contiguous array
//! indexed by PFN. The array is carved out of boot memory and installed
//! once; descriptors live for the lifetime of the kernel.

use core::ptr::NonNull;

use argon_sync::Spin;
use bitflags::bitflags;

use crate::address::PAddr;
use crate::paging::PFN;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u16 {
        /// Usable RAM, currently on a buddy free list or awaiting seeding.
        const FREE = 0x01;
        /// Owned by the kernel image or a kernel data structure.
        const KERNEL = 0x02;
        /// Device or firmware memory, never handed out.
        const RESERVED = 0x04;
        /// Outside the memory map or known-bad RAM; never usable.
        const POISONED = 0x08;
        /// Pinned; must not be reclaimed.
        const LOCKED = 0x10;
        /// Head of a buddy block, free or allocated.
        const BUDDY = 0x20;
    }
}

impl FrameFlags {
    /// The mutually exclusive type bits. Exactly one is set on every frame
    /// once the table has been populated.
    pub const TYPE_MASK: FrameFlags = FrameFlags::FREE
        .union(FrameFlags::KERNEL)
        .union(FrameFlags::RESERVED)
        .union(FrameFlags::POISONED);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Free,
    Kernel,
    Reserved,
    Poisoned,
}

impl FrameType {
    const fn bit(self) -> FrameFlags {
        match self {
            FrameType::Free => FrameFlags::FREE,
            FrameType::Kernel => FrameFlags::KERNEL,
            FrameType::Reserved => FrameFlags::RESERVED,
            FrameType::Poisoned => FrameFlags::POISONED,
        }
    }
}

pub struct Frame {
    pub flags: FrameFlags,
    /// Buddy order. Meaningful on the head frame of a buddy block only;
    /// tail frames carry 0.
    pub order: u8,
    /// Reference count.
    pub count: u16,
    /// Owner cookie, set by the slab layer on every frame of a slab region
    /// so that a bare pointer can be traced back to its cache.
    pub slab: Option<NonNull<()>>,
}

impl Frame {
    pub const fn new() -> Self {
        Self {
            flags: FrameFlags::POISONED,
            order: 0,
            count: 0,
            slab: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameStats {
    pub free: usize,
    pub kernel: usize,
    pub reserved: usize,
    pub poisoned: usize,
}

impl FrameStats {
    const fn empty() -> Self {
        Self {
            free: 0,
            kernel: 0,
            reserved: 0,
            poisoned: 0,
        }
    }
}

struct FrameArray {
    base: Option<NonNull<Frame>>,
    len: usize,
    stats: FrameStats,
}

// SAFETY: The descriptor array is global by construction; the lock
// serializes the metadata, and descriptor contents are only touched from
// the single kernel CPU.
unsafe impl Send for FrameArray {}

static FRAMES: Spin<FrameArray> = Spin::new(FrameArray {
    base: None,
    len: 0,
    stats: FrameStats::empty(),
});

/// A copyable handle to one frame descriptor.
///
/// Handles outlive the lock that produced them; all mutation below goes
/// through raw pointer writes and is only sound from the single kernel
/// context (or the serialized host test harness).
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct FramePtr {
    frame: NonNull<Frame>,
    pfn: PFN,
}

impl FramePtr {
    pub const fn pfn(&self) -> PFN {
        self.pfn
    }

    pub fn paddr(&self) -> PAddr {
        PAddr::from(self.pfn)
    }

    fn raw(&self) -> *mut Frame {
        self.frame.as_ptr()
    }

    pub fn flags(&self) -> FrameFlags {
        unsafe { (*self.raw()).flags }
    }

    pub fn has(&self, flags: FrameFlags) -> bool {
        self.flags().contains(flags)
    }

    pub fn insert_flags(&self, flags: FrameFlags) {
        unsafe { (*self.raw()).flags.insert(flags) };
    }

    pub fn remove_flags(&self, flags: FrameFlags) {
        unsafe { (*self.raw()).flags.remove(flags) };
    }

    pub fn order(&self) -> u8 {
        unsafe { (*self.raw()).order }
    }

    pub fn set_order(&self, order: u8) {
        unsafe { (*self.raw()).order = order };
    }

    pub fn count(&self) -> u16 {
        unsafe { (*self.raw()).count }
    }

    pub fn set_count(&self, count: u16) {
        unsafe { (*self.raw()).count = count };
    }

    pub fn slab(&self) -> Option<NonNull<()>> {
        unsafe { (*self.raw()).slab }
    }

    pub fn set_slab(&self, slab: Option<NonNull<()>>) {
        unsafe { (*self.raw()).slab = slab };
    }
}

/// Install the frame descriptor array.
///
/// Every descriptor is initialized to `POISONED` (the fail-safe default);
/// the counters are reset accordingly.
///
/// # Safety
/// `base` must point to memory for `count` descriptors that stays valid for
/// as long as the table is in use.
pub unsafe fn install(base: NonNull<Frame>, count: usize) {
    for i in 0..count {
        unsafe { base.add(i).write(Frame::new()) };
    }

    let mut frames = FRAMES.lock();
    frames.base = Some(base);
    frames.len = count;
    frames.stats = FrameStats {
        poisoned: count,
        ..FrameStats::empty()
    };
}

/// Number of frames covered by the table.
pub fn frame_count() -> usize {
    FRAMES.lock().len
}

pub fn stats() -> FrameStats {
    FRAMES.lock().stats
}

/// Descriptor of the frame containing `paddr`, or `None` when the address
/// lies past the end of the table.
pub fn info(paddr: PAddr) -> Option<FramePtr> {
    pfn_info(PFN::from(paddr))
}

pub fn pfn_info(pfn: PFN) -> Option<FramePtr> {
    let frames = FRAMES.lock();
    let base = frames.base?;
    let idx = usize::from(pfn);

    if idx >= frames.len {
        return None;
    }

    Some(FramePtr {
        frame: unsafe { base.add(idx) },
        pfn,
    })
}

/// Retype a frame, keeping the per-type counters balanced. The additive
/// bits are cleared along the way, as a retyped frame starts a new life.
pub fn change_type(frame: FramePtr, new_type: FrameType) {
    let mut frames = FRAMES.lock();
    let stats = &mut frames.stats;

    let old = frame.flags();
    if old.contains(FrameFlags::FREE) {
        stats.free -= 1;
    } else if old.contains(FrameFlags::KERNEL) {
        stats.kernel -= 1;
    } else if old.contains(FrameFlags::RESERVED) {
        stats.reserved -= 1;
    } else if old.contains(FrameFlags::POISONED) {
        stats.poisoned -= 1;
    }

    match new_type {
        FrameType::Free => stats.free += 1,
        FrameType::Kernel => stats.kernel += 1,
        FrameType::Reserved => stats.reserved += 1,
        FrameType::Poisoned => stats.poisoned += 1,
    }

    unsafe { (*frame.raw()).flags = new_type.bit() };
}

#[cfg(feature = "sim")]
pub(crate) fn reset() {
    let mut frames = FRAMES.lock();
    frames.base = None;
    frames.len = 0;
    frames.stats = FrameStats::empty();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, PoisonError};
    use std::vec::Vec;

    // The frame table is process-global; serialize the tests that install
    // one.
    static TABLE: Mutex<()> = Mutex::new(());

    fn with_table<R>(count: usize, f: impl FnOnce() -> R) -> R {
        let _guard = TABLE.lock().unwrap_or_else(PoisonError::into_inner);
        let mut frames: Vec<Frame> = (0..count).map(|_| Frame::new()).collect();
        unsafe { install(NonNull::new(frames.as_mut_ptr()).unwrap(), count) };
        f()
    }

    #[test]
    fn install_poisons_everything() {
        with_table(8, || {
            assert_eq!(frame_count(), 8);
            assert_eq!(stats().poisoned, 8);

            for pfn in 0..8 {
                let frame = pfn_info(PFN::from(pfn)).unwrap();
                assert_eq!(frame.flags(), FrameFlags::POISONED);
                assert_eq!(frame.order(), 0);
                assert_eq!(frame.count(), 0);
                assert!(frame.slab().is_none());
            }
        });
    }

    #[test]
    fn change_type_keeps_the_counters_balanced() {
        with_table(8, || {
            change_type(pfn_info(PFN::from(0)).unwrap(), FrameType::Free);
            change_type(pfn_info(PFN::from(1)).unwrap(), FrameType::Kernel);
            change_type(pfn_info(PFN::from(2)).unwrap(), FrameType::Reserved);

            let s = stats();
            assert_eq!((s.free, s.kernel, s.reserved, s.poisoned), (1, 1, 1, 5));

            change_type(pfn_info(PFN::from(0)).unwrap(), FrameType::Kernel);
            let s = stats();
            assert_eq!((s.free, s.kernel), (0, 2));
            assert_eq!(s.free + s.kernel + s.reserved + s.poisoned, frame_count());
        });
    }

    #[test]
    fn retyping_clears_additive_bits() {
        with_table(4, || {
            let frame = pfn_info(PFN::from(3)).unwrap();
            change_type(frame, FrameType::Free);
            frame.insert_flags(FrameFlags::BUDDY | FrameFlags::LOCKED);

            change_type(frame, FrameType::Kernel);
            assert_eq!(frame.flags(), FrameFlags::KERNEL);
        });
    }

    #[test]
    fn lookups_past_the_table_return_nothing() {
        with_table(4, || {
            assert!(pfn_info(PFN::from(3)).is_some());
            assert!(pfn_info(PFN::from(4)).is_none());
            assert!(info(PAddr::from(4 * crate::paging::PAGE_SIZE)).is_none());

            // Any address inside a frame resolves to that frame.
            let frame = info(PAddr::from(crate::paging::PAGE_SIZE + 1)).unwrap();
            assert_eq!(usize::from(frame.pfn()), 1);
        });
    }
}
