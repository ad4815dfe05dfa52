//! Boot-time memory bootstrap.
//!
//! Before the frame table exists, the bootloader memory map is the only
//! record of what RAM we have. These routines sanitize it and carve early
//! allocations directly out of it, shrinking the entries in place so that
//! the rest of setup never sees memory that is already spoken for.

use core::mem::size_of;
use core::ptr::NonNull;

use align_ext::AlignExt;

use argon_mm::address::{PAddr, PRange};
use argon_mm::phys::PhysAccess;

use crate::arch::x86::multiboot::{MB_MEMORY_AVAILABLE, MbMmapEntry};

const BOOT_ALLOC_ALIGN: usize = 16;

/// Highest physical address expressible here, page aligned so that
/// rounding a clamped address up cannot overflow. Entries past it (a
/// 64-bit map on a 32-bit kernel) are cut off.
pub(crate) const PADDR_CAP: u64 =
    usize::MAX as u64 & !(argon_mm::paging::PAGE_SIZE as u64 - 1);

/// A view of the bootloader memory map records.
pub struct MemoryMap {
    base: NonNull<u8>,
    length: usize,
}

pub struct Entries {
    cursor: *mut u8,
    end: *mut u8,
}

impl MemoryMap {
    /// # Safety
    /// `base` must point to `length` bytes of multiboot memory map records
    /// that stay valid, and exclusively ours, for the lifetime of the map.
    pub unsafe fn from_raw(base: NonNull<u8>, length: usize) -> Self {
        Self { base, length }
    }

    /// Iterate the raw records. Entries are yielded as pointers because
    /// sanitation and the boot allocator rewrite them in place.
    pub fn entries(&self) -> Entries {
        Entries {
            cursor: self.base.as_ptr(),
            end: unsafe { self.base.as_ptr().add(self.length) },
        }
    }
}

impl Iterator for Entries {
    type Item = NonNull<MbMmapEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            return None;
        }

        let entry = self.cursor as *mut MbMmapEntry;
        let size = unsafe { (*entry).size };
        self.cursor = unsafe { self.cursor.add(size as usize + size_of::<u32>()) };

        Some(unsafe { NonNull::new_unchecked(entry) })
    }
}

/// Exclude the loaded kernel image from the map.
///
/// The bootloader reports the region the kernel was loaded into as
/// available; the image occupies its front, starting exactly at the
/// kernel's physical base. Shrink that entry so the boot allocator cannot
/// hand out kernel code and data.
///
/// # Panics
/// If no available entry starts at the kernel image; the map is not one
/// we know how to boot from.
pub fn sanitize(map: &MemoryMap, kernel_image: PRange) {
    let kernel_size = kernel_image.len() as u64;
    let mut kernel_found = false;

    for entry in map.entries() {
        let e = entry.as_ptr();
        unsafe {
            if (*e).entry_type == MB_MEMORY_AVAILABLE
                && (*e).addr == kernel_image.start().addr() as u64
            {
                (*e).addr += kernel_size;
                (*e).len -= kernel_size;
                kernel_found = true;
            }
        }
    }

    if !kernel_found {
        panic!("kernel memory not found in the memory map");
    }
}

/// The highest usable physical address: the frame table does not need to
/// reach past it.
pub fn last_usable(map: &MemoryMap) -> Option<PAddr> {
    let mut last: Option<u64> = None;

    for entry in map.entries() {
        let e = entry.as_ptr();
        unsafe {
            if (*e).entry_type == MB_MEMORY_AVAILABLE && (*e).len > 0 {
                let end = (*e).addr.saturating_add((*e).len) - 1;
                if last.is_none_or(|l| end > l) {
                    last = Some(end);
                }
            }
        }
    }

    last.map(|end| PAddr::from(end.min(PADDR_CAP) as usize))
}

/// Allocate `size` bytes by carving them out of an available entry,
/// 16-byte aligned. Returns a kernel-virtual pointer, or `None` when no
/// entry is large enough; there is no way to free.
pub fn alloc_boot_memory<P: PhysAccess>(map: &MemoryMap, size: usize) -> Option<NonNull<u8>> {
    let needed = (size + BOOT_ALLOC_ALIGN) as u64;
    let mut found: Option<*mut MbMmapEntry> = None;

    for entry in map.entries() {
        let e = entry.as_ptr();
        unsafe {
            if (*e).entry_type == MB_MEMORY_AVAILABLE
                && (*e).len >= needed
                && (*e).addr + needed <= usize::MAX as u64
            {
                found = Some(e);
            }
        }
    }

    let e = found?;
    unsafe {
        let base = (*e).addr as usize;
        let aligned = base.align_up(BOOT_ALLOC_ALIGN);
        let misalign = aligned - base;

        (*e).addr = (aligned + size) as u64;
        (*e).len -= (size + misalign) as u64;

        Some(P::as_ptr::<u8>(PAddr::from(aligned)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86::multiboot::MB_MEMORY_RESERVED;
    use crate::kernel::mem::testutil::build_map;
    use argon_mm::sim::{SimMachine, SimPhys};
    use std::vec::Vec;

    fn map_of(buf: &mut [u8]) -> MemoryMap {
        unsafe { MemoryMap::from_raw(NonNull::new(buf.as_mut_ptr()).unwrap(), buf.len()) }
    }

    fn entry_triples(map: &MemoryMap) -> Vec<(u64, u64, u32)> {
        map.entries()
            .map(|e| unsafe {
                let e = e.as_ptr();
                ((*e).addr, (*e).len, (*e).entry_type)
            })
            .collect()
    }

    #[test]
    fn sanitize_shrinks_the_kernel_entry() {
        let mut buf = build_map(&[
            (0, 0xa0000, MB_MEMORY_AVAILABLE),
            (0xa0000, 0x60000, MB_MEMORY_RESERVED),
            (0x10_0000, 0x7f0_0000, MB_MEMORY_AVAILABLE),
        ]);
        let map = map_of(&mut buf);

        let image = PRange::new(PAddr::from(0x10_0000), PAddr::from(0x12_0000));
        sanitize(&map, image);

        let entries = entry_triples(&map);
        assert_eq!(entries[0], (0, 0xa0000, MB_MEMORY_AVAILABLE));
        assert_eq!(entries[2], (0x12_0000, 0x7ee_0000, MB_MEMORY_AVAILABLE));
    }

    #[test]
    #[should_panic(expected = "kernel memory not found")]
    fn sanitize_requires_the_kernel_entry() {
        let mut buf = build_map(&[(0, 0xa0000, MB_MEMORY_AVAILABLE)]);
        let map = map_of(&mut buf);
        sanitize(
            &map,
            PRange::new(PAddr::from(0x10_0000), PAddr::from(0x12_0000)),
        );
    }

    #[test]
    fn last_usable_is_the_highest_available_end() {
        let mut buf = build_map(&[
            (0x10_0000, 0x10_0000, MB_MEMORY_AVAILABLE),
            (0, 0xa0000, MB_MEMORY_AVAILABLE),
            (0xfff0_0000, 0x10_0000, MB_MEMORY_RESERVED),
        ]);
        let map = map_of(&mut buf);

        assert_eq!(last_usable(&map), Some(PAddr::from(0x1f_ffff)));
    }

    #[test]
    fn entries_chain_through_odd_record_sizes() {
        // Some BIOSes append extra bytes to a record; the `size` field is
        // what moves the cursor.
        let mut buf = Vec::new();
        buf.extend_from_slice(&24u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&0xa0000u64.to_le_bytes());
        buf.extend_from_slice(&MB_MEMORY_AVAILABLE.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // padding counted by `size`
        buf.extend_from_slice(&build_map(&[(0x10_0000, 0x10_0000, MB_MEMORY_RESERVED)]));

        let map = map_of(&mut buf);
        let entries = entry_triples(&map);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], (0x10_0000, 0x10_0000, MB_MEMORY_RESERVED));
    }

    #[test]
    fn boot_allocations_come_from_the_last_fitting_entry() {
        let _machine = SimMachine::bare(1024);
        let mut buf = build_map(&[
            (0x1008, 0x10_0000, MB_MEMORY_AVAILABLE),
            (0x20_0000, 0x1000, MB_MEMORY_AVAILABLE),
        ]);
        let map = map_of(&mut buf);

        // The second entry is too small for the request plus alignment,
        // so the first one is carved, from an aligned base.
        let ptr = alloc_boot_memory::<SimPhys>(&map, 0x2000).unwrap();
        assert_eq!(unsafe { SimPhys::from_ptr(ptr) }, PAddr::from(0x1010));

        let entries = entry_triples(&map);
        assert_eq!(entries[0].0, 0x3010);
        assert_eq!(entries[0].1, 0x10_0000 - 0x2000 - 8);

        // A second carve continues behind the first.
        let next = alloc_boot_memory::<SimPhys>(&map, 0x100).unwrap();
        assert_eq!(unsafe { SimPhys::from_ptr(next) }, PAddr::from(0x3010));
    }

    #[test]
    fn boot_allocation_fails_when_nothing_fits() {
        let mut buf = build_map(&[(0x1000, 0x800, MB_MEMORY_AVAILABLE)]);
        let map = map_of(&mut buf);
        assert!(alloc_boot_memory::<SimPhys>(&map, 0x1000).is_none());
    }
}
