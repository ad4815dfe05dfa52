#![no_std]

//! A small higher-half x86 kernel built around its physical memory
//! management core: a typed page frame table, a buddy allocator for
//! contiguous page blocks, and a slub allocator for fixed-size kernel
//! objects backing `kmalloc`.

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod kernel;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod driver;
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod io;
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod panic;
