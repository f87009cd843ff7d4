/// A block allocator for zero-filled blocks of memory that must be:
///  - powers of two in size
///  - aligned to their size
///
/// Size alignment means the base of the block containing any interior address
/// can be found by masking off the low bits of that address.
///
/// Usage:
/// ```
/// use blockalloc::Block;
///
/// let size = 4096;  // must be a power of 2
/// let block = Block::new(size).unwrap();
/// assert!(block.contains(block.base() + 100));
/// ```
///
/// Normal scoping rules will call Block::drop() when `block` goes out of scope
/// causing the block to be fully deallocated.
use std::ptr::NonNull;

pub type BlockPtr = NonNull<u8>;
pub type BlockSize = usize;

/// Set of possible block allocation failures
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BlockError {
    /// Usually means requested block size, and therefore alignment, wasn't a
    /// power of two
    BadRequest,
    /// Insufficient memory, couldn't allocate a block
    OOM,
}

/// A block-size-aligned, zero-initialized block of memory
pub struct Block {
    ptr: BlockPtr,
    size: BlockSize,
}

// A Block uniquely owns its memory; sharing it between threads is governed by
// whatever structure the block is embedded in.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    /// Instantiate a new block of the given size. Size must be a power of two
    /// and at least one word.
    pub fn new(size: BlockSize) -> Result<Block, BlockError> {
        if size < std::mem::size_of::<usize>() || size & (size - 1) != 0 {
            return Err(BlockError::BadRequest);
        }

        Ok(Block {
            ptr: internal::alloc_block(size)?,
            size,
        })
    }

    /// Return the size in bytes of the block
    pub fn size(&self) -> BlockSize {
        self.size
    }

    /// Return a bare pointer to the base of the block
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Return the base address of the block as a word
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// One past the last address in the block
    pub fn limit(&self) -> usize {
        self.base() + self.size
    }

    /// Is the given address inside this block?
    pub fn contains(&self, addr: usize) -> bool {
        addr & !(self.size - 1) == self.base()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        internal::dealloc_block(self.ptr, self.size);
    }
}

/// The set of possible allocation sources
#[derive(Debug, PartialEq)]
pub enum BlockSource {
    RustAlloc,
    PosixMemalign,
}

pub fn block_source() -> BlockSource {
    internal::BLOCK_SOURCE
}

#[cfg(unix)]
mod internal {
    use super::{BlockError, BlockPtr, BlockSize, BlockSource};
    use std::ptr::{self, NonNull};

    pub const BLOCK_SOURCE: BlockSource = BlockSource::PosixMemalign;

    pub fn alloc_block(size: BlockSize) -> Result<BlockPtr, BlockError> {
        let mut address: *mut libc::c_void = ptr::null_mut();

        unsafe {
            match libc::posix_memalign(&mut address, size, size) {
                0 => {}
                libc::EINVAL => return Err(BlockError::BadRequest),
                _ => return Err(BlockError::OOM),
            }

            // posix_memalign makes no promise about the contents
            ptr::write_bytes(address as *mut u8, 0, size);

            NonNull::new(address as *mut u8).ok_or(BlockError::OOM)
        }
    }

    pub fn dealloc_block(ptr: BlockPtr, _size: BlockSize) {
        unsafe { libc::free(ptr.as_ptr() as *mut libc::c_void) }
    }
}

#[cfg(not(unix))]
mod internal {
    use super::{BlockError, BlockPtr, BlockSize, BlockSource};
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::ptr::NonNull;

    pub const BLOCK_SOURCE: BlockSource = BlockSource::RustAlloc;

    pub fn alloc_block(size: BlockSize) -> Result<BlockPtr, BlockError> {
        let layout = Layout::from_size_align(size, size).map_err(|_| BlockError::BadRequest)?;

        unsafe { NonNull::new(alloc_zeroed(layout)).ok_or(BlockError::OOM) }
    }

    pub fn dealloc_block(ptr: BlockPtr, size: BlockSize) {
        unsafe {
            let layout = Layout::from_size_align_unchecked(size, size);

            dealloc(ptr.as_ptr(), layout);
        }
    }
}

#[cfg(test)]
mod tests {

    use crate::{block_source, Block, BlockError, BlockSize, BlockSource};

    fn alloc_dealloc(size: BlockSize) -> Result<(), BlockError> {
        let block = Block::new(size)?;

        // the block address bitwise AND the alignment bits (size - 1) should
        // be a mutually exclusive set of bits
        let mask = size - 1;
        assert!((block.ptr.as_ptr() as usize & mask) ^ mask == mask);

        drop(block);
        Ok(())
    }

    #[test]
    fn test_bad_sizealign() {
        assert!(alloc_dealloc(999) == Err(BlockError::BadRequest))
    }

    #[test]
    fn test_too_small() {
        assert!(alloc_dealloc(2) == Err(BlockError::BadRequest))
    }

    #[test]
    fn test_4k() {
        assert!(alloc_dealloc(4096).is_ok())
    }

    #[test]
    fn test_256k() {
        assert!(alloc_dealloc(256 * 1024).is_ok())
    }

    #[test]
    fn test_16m() {
        assert!(alloc_dealloc(16 * 1024 * 1024).is_ok())
    }

    #[test]
    fn test_zeroed() {
        let block = Block::new(64 * 1024).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), block.size()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_contains() {
        let block = Block::new(4096).unwrap();
        assert!(block.contains(block.base()));
        assert!(block.contains(block.limit() - 1));
        assert!(!block.contains(block.limit()));
        assert!(!block.contains(block.base() - 1));
    }

    #[test]
    fn test_source() {
        if cfg!(unix) {
            assert_eq!(block_source(), BlockSource::PosixMemalign);
        } else {
            assert_eq!(block_source(), BlockSource::RustAlloc);
        }
    }
}
