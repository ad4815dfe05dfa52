//! Multiboot 1 handoff structures.
//!
//! The bootloader leaves an [`MbInfo`] in low memory and its physical
//! address in `%ebx`. Memory map records are variable-size: each entry's
//! `size` field counts the bytes *after* itself, so the next record lives
//! at `entry + size + 4`.

use bitflags::bitflags;

pub const MB_BOOTLOADER_MAGIC: u32 = 0x2BADB002;

pub const MB_MEMORY_AVAILABLE: u32 = 1;
pub const MB_MEMORY_RESERVED: u32 = 2;
pub const MB_MEMORY_ACPI_RECLAIMABLE: u32 = 3;
pub const MB_MEMORY_NVS: u32 = 4;
pub const MB_MEMORY_BADRAM: u32 = 5;

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct MbInfoFlags: u32 {
        const MEMORY = 0x0000_0001;
        const BOOTDEV = 0x0000_0002;
        const CMDLINE = 0x0000_0004;
        const MODS = 0x0000_0008;
        const AOUT_SYMS = 0x0000_0010;
        const ELF_SHDR = 0x0000_0020;
        const MEMMAP = 0x0000_0040;
        const DRIVE_INFO = 0x0000_0080;
        const CONFIG_TABLE = 0x0000_0100;
        const BOOT_LOADER_NAME = 0x0000_0200;
        const APM_TABLE = 0x0000_0400;
        const VBE_INFO = 0x0000_0800;
        const FRAMEBUFFER_INFO = 0x0000_1000;
    }
}

#[repr(C, packed)]
pub struct MbElfTable {
    pub num: u32,
    pub size: u32,
    pub addr: u32,
    pub shndx: u32,
}

#[repr(C, packed)]
pub struct MbInfo {
    pub flags: u32,
    /// KiB of memory below 1 MiB.
    pub mem_lower: u32,
    /// KiB of memory above 1 MiB.
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub elf_sec: MbElfTable,
    pub mmap_length: u32,
    pub mmap_addr: u32,
    pub drives_length: u32,
    pub drives_addr: u32,
}

#[repr(C, packed)]
pub struct MbMmapEntry {
    /// Size of the record minus this field.
    pub size: u32,
    pub addr: u64,
    pub len: u64,
    pub entry_type: u32,
}

impl MbInfo {
    pub fn has(&self, flags: MbInfoFlags) -> bool {
        MbInfoFlags::from_bits_truncate(self.flags).contains(flags)
    }
}
