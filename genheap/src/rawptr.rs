use std::fmt;
use std::num::NonZeroUsize;

use crate::constants;

/// The address of a cell header. A bare word with no type information
/// attached: the cell kind is read from the header it points at.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellPtr {
    addr: NonZeroUsize,
}

impl CellPtr {
    /// Wrap an address. The address must be non-null and heap aligned.
    pub(crate) fn from_addr(addr: usize) -> CellPtr {
        debug_assert!(addr != 0 && addr & (constants::HEAP_ALIGN - 1) == 0);
        CellPtr {
            addr: unsafe { NonZeroUsize::new_unchecked(addr) },
        }
    }

    /// Get the pointer value as a word-sized integer
    pub fn as_word(&self) -> usize {
        self.addr.get()
    }

    /// The base address of the segment the cell lives in
    pub(crate) fn segment_base(&self) -> usize {
        self.as_word() & constants::SEGMENT_PTR_MASK
    }

    /// The address `bytes` past the cell header
    pub(crate) fn offset(&self, bytes: usize) -> usize {
        self.as_word() + bytes
    }
}

impl fmt::Debug for CellPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CellPtr({:#x})", self.as_word())
    }
}
