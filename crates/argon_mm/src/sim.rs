//! Synthetic physical memory for host unit tests.
//!
//! Stands in for the bootloader-provided RAM and the kernel direct map so
//! the allocator stack can run under `cargo test`. One [`SimMachine`] exists
//! at a time; construction takes a process-wide lock because the frame
//! table and the arena are global, matching the single-CPU model the kernel
//! itself assumes.

use core::ptr::NonNull;

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::boxed::Box;
use std::sync::{Mutex, MutexGuard, PoisonError};

use argon_sync::Spin;

use crate::address::PAddr;
use crate::frame::{self, Frame, FrameType};
use crate::paging::{PAGE_SIZE, PFN};
use crate::phys::PhysAccess;

struct Arena {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: The arena is only reached through the serialized machinery below.
unsafe impl Send for Arena {}

static ARENA: Spin<Option<Arena>> = Spin::new(None);
static MACHINE: Mutex<()> = Mutex::new(());

/// [`PhysAccess`] over the simulated arena: physical address zero is the
/// arena base.
pub struct SimPhys;

impl PhysAccess for SimPhys {
    unsafe fn as_ptr<T>(paddr: PAddr) -> NonNull<T> {
        let arena = ARENA.lock();
        let arena = arena.as_ref().expect("no simulated physical memory");
        assert!(
            paddr.addr() < arena.size,
            "{paddr:?} outside the simulated arena"
        );

        unsafe { NonNull::new_unchecked(arena.base.as_ptr().add(paddr.addr())).cast() }
    }

    unsafe fn from_ptr<T>(ptr: NonNull<T>) -> PAddr {
        let arena = ARENA.lock();
        let arena = arena.as_ref().expect("no simulated physical memory");
        let offset = (ptr.as_ptr() as usize).wrapping_sub(arena.base.as_ptr() as usize);
        assert!(offset < arena.size, "pointer outside the simulated arena");

        PAddr::from(offset)
    }
}

pub struct SimMachine {
    base: NonNull<u8>,
    layout: Layout,
    _frames: Option<Box<[Frame]>>,
    _guard: MutexGuard<'static, ()>,
}

impl SimMachine {
    /// An arena of `pages` frames with no frame table installed. Used by
    /// tests that drive the boot path, which builds its own table inside
    /// the arena.
    pub fn bare(pages: usize) -> Self {
        let guard = MACHINE.lock().unwrap_or_else(PoisonError::into_inner);

        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("arena allocation failed");
        *ARENA.lock() = Some(Arena {
            base,
            size: pages * PAGE_SIZE,
        });

        Self {
            base,
            layout,
            _frames: None,
            _guard: guard,
        }
    }

    /// An arena of `pages` frames with a frame table installed and every
    /// frame typed `FREE`, ready for buddy seeding.
    pub fn with_free_frames(pages: usize) -> Self {
        let mut machine = Self::bare(pages);

        let mut frames: Box<[Frame]> = (0..pages).map(|_| Frame::new()).collect();
        unsafe { frame::install(NonNull::new(frames.as_mut_ptr()).unwrap(), pages) };
        for pfn in 0..pages {
            frame::change_type(frame::pfn_info(PFN::from(pfn)).unwrap(), FrameType::Free);
        }

        machine._frames = Some(frames);
        machine
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }
}

impl Drop for SimMachine {
    fn drop(&mut self) {
        frame::reset();
        *ARENA.lock() = None;
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
