use core::fmt;

use super::PAGE_SIZE_BITS;
use crate::address::PAddr;

/// Physical frame number: a physical address divided by the page size.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PFN(usize);

impl From<PFN> for usize {
    fn from(v: PFN) -> Self {
        v.0
    }
}

impl From<usize> for PFN {
    fn from(v: usize) -> Self {
        Self(v)
    }
}

impl From<PAddr> for PFN {
    fn from(paddr: PAddr) -> Self {
        Self(paddr.addr() >> PAGE_SIZE_BITS)
    }
}

impl fmt::Debug for PFN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PFN({:#x})", self.0)
    }
}
