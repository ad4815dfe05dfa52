//! Frame table construction from the bootloader memory map.

use core::mem::size_of;

use argon_log::println_debug;
use argon_mm::address::{PAddr, PRange};
use argon_mm::frame::{self, Frame, FrameType};
use argon_mm::paging::PFN;
use argon_mm::phys::PhysAccess;

use super::bootmem::{self, MemoryMap};
use crate::arch::x86::multiboot::{MB_MEMORY_AVAILABLE, MB_MEMORY_RESERVED};

/// VGA and BIOS window, reserved whatever the memory map says.
const BIOS_WINDOW_START: usize = 0xa_0000;
const BIOS_WINDOW_END: usize = 0x10_0000;

/// The BIOS can only address the first megabyte.
pub fn bios_compatible(paddr: PAddr) -> bool {
    paddr.addr() < 0x10_0000
}

/// ISA devices can only address the first megabyte.
pub fn isa_compatible(paddr: PAddr) -> bool {
    paddr.addr() < 0x10_0000
}

/// Low memory is directly mapped and needs no temporary mapping to touch.
pub fn lowmem_compatible(paddr: PAddr) -> bool {
    paddr.addr() < 0x2000_0000
}

/// Build the frame table.
///
/// The map is sanitized, the descriptor array is carved out of it, and
/// every frame is typed: poisoned by default, free or reserved as the map
/// vouches, and kernel-owned for the image and the array itself.
pub fn page_setup<P: PhysAccess>(map: &MemoryMap, kernel_image: PRange) {
    bootmem::sanitize(map, kernel_image);

    let last = bootmem::last_usable(map).expect("no usable memory in the memory map");
    let pg_count = usize::from(PFN::from(last.ceil()));

    let frames = bootmem::alloc_boot_memory::<P>(map, pg_count * size_of::<Frame>())
        .expect("unable to allocate memory for the frame table");
    let frames = frames.cast::<Frame>();
    unsafe { frame::install(frames, pg_count) };

    println_debug!("frame table at {:p} ({} frames)", frames.as_ptr(), pg_count);

    // Type the frames the map vouches for; everything else stays
    // poisoned. Partial pages at the edge of a usable range are not fully
    // usable and are left out; partially reserved pages are reserved
    // whole.
    for entry in map.entries() {
        let e = entry.as_ptr();
        let (addr, len, entry_type) = unsafe { ((*e).addr, (*e).len, (*e).entry_type) };
        let start = PAddr::from(addr.min(bootmem::PADDR_CAP) as usize);
        let end = PAddr::from(addr.saturating_add(len).min(bootmem::PADDR_CAP) as usize);

        match entry_type {
            MB_MEMORY_AVAILABLE => retype(start.ceil(), end.floor(), FrameType::Free),
            MB_MEMORY_RESERVED => retype(start.floor(), end.ceil(), FrameType::Reserved),
            _ => {}
        }
    }

    // PFN 0 backs the null pointer and is never handed out.
    if let Some(zero) = frame::pfn_info(PFN::from(0)) {
        frame::change_type(zero, FrameType::Reserved);
    }

    retype(
        PAddr::from(BIOS_WINDOW_START),
        PAddr::from(BIOS_WINDOW_END),
        FrameType::Reserved,
    );

    // The kernel image and the frame table itself are live kernel data.
    claim_for_kernel(kernel_image.start().floor(), kernel_image.end().ceil());
    let table_start = unsafe { P::from_ptr(frames) };
    let table_end = table_start + pg_count * size_of::<Frame>();
    claim_for_kernel(table_start.floor(), table_end.ceil());

    page_debug();
}

/// Report the per-type frame counts on the console.
pub fn page_debug() {
    let stats = frame::stats();
    println_debug!("free pages: {} ({} KiB)", stats.free, stats.free * 4);
    println_debug!("kernel pages: {} ({} KiB)", stats.kernel, stats.kernel * 4);
    println_debug!(
        "reserved pages: {} ({} KiB)",
        stats.reserved,
        stats.reserved * 4
    );
    println_debug!(
        "poisoned pages: {} ({} KiB)",
        stats.poisoned,
        stats.poisoned * 4
    );
}

fn retype(start: PAddr, end: PAddr, frame_type: FrameType) {
    for pfn in usize::from(PFN::from(start))..usize::from(PFN::from(end)) {
        if let Some(frame) = frame::pfn_info(PFN::from(pfn)) {
            frame::change_type(frame, frame_type);
        }
    }
}

fn claim_for_kernel(start: PAddr, end: PAddr) {
    for pfn in usize::from(PFN::from(start))..usize::from(PFN::from(end)) {
        if let Some(frame) = frame::pfn_info(PFN::from(pfn)) {
            frame::change_type(frame, FrameType::Kernel);
            frame.set_count(1);
        }
    }
}

/// Kernel-side entry: unpack the multiboot structure and run
/// [`page_setup`] over the direct map.
///
/// # Panics
/// If the bootloader did not pass a memory map.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn page_setup_from_mb(mb_info: &mut crate::arch::x86::multiboot::MbInfo) {
    use crate::arch::x86::multiboot::MbInfoFlags;
    use crate::kernel::constants::KERNEL_VBASE;
    use crate::kernel::mem::DirectPhysAccess;
    use core::ptr::NonNull;

    if !mb_info.has(MbInfoFlags::MEMMAP) {
        panic!("no memory map provided by the bootloader");
    }

    // The map is handed over by physical address; reach it through the
    // direct map from here on.
    mb_info.mmap_addr += KERNEL_VBASE as u32;

    let map = unsafe {
        MemoryMap::from_raw(
            NonNull::new(mb_info.mmap_addr as usize as *mut u8).expect("null memory map pointer"),
            mb_info.mmap_length as usize,
        )
    };

    page_setup::<DirectPhysAccess>(&map, kernel_image_range());
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn kernel_image_range() -> PRange {
    use crate::kernel::constants::{KERNEL_PBASE, KERNEL_VBASE};

    // First byte past the loaded image, placed by the linker script.
    extern "C" {
        static __end: u8;
    }

    let end = unsafe { &__end as *const u8 as usize };
    let end = PAddr::from(end - KERNEL_VBASE).ceil();

    PRange::new(PAddr::from(KERNEL_PBASE), end)
}
