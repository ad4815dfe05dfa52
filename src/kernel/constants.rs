/// Base of the kernel virtual address space: physical address `p` is
/// mapped at `p + KERNEL_VBASE` for the first gigabyte.
pub const KERNEL_VBASE: usize = 0xc000_0000;

/// Physical load address of the kernel image.
pub const KERNEL_PBASE: usize = 0x0010_0000;

/// Extent of the direct map: one gigabyte of physical memory.
pub const KERNEL_MAX_PAGE: usize = 0x4000_0000;
