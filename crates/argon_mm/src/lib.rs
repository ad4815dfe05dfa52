#![no_std]

#[cfg(any(test, feature = "sim"))]
extern crate std;

pub mod address;
pub mod frame;
pub mod paging;
pub mod phys;

#[cfg(feature = "sim")]
pub mod sim;
