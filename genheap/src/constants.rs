use std::mem::size_of;

pub const SEGMENT_SIZE_BITS: usize = 18;
pub const SEGMENT_SIZE: usize = 1 << SEGMENT_SIZE_BITS;
pub const SEGMENT_PTR_MASK: usize = !(SEGMENT_SIZE - 1);

/// Every cell starts on a word boundary and every word gets a mark bit
pub const HEAP_ALIGN_BITS: usize = 3;
pub const HEAP_ALIGN: usize = 1 << HEAP_ALIGN_BITS;
pub const WORDS_PER_SEGMENT: usize = SEGMENT_SIZE / HEAP_ALIGN;

/// The first cell in a segment is not at offset 0 - that location is reserved
/// for a pointer to the SegmentMeta struct for the segment - but at the next
/// double-word offset.
pub const FIRST_CELL_OFFSET: usize = size_of::<usize>() * 2;
pub const SEGMENT_CAPACITY: usize = SEGMENT_SIZE - FIRST_CELL_OFFSET;

pub const CARD_SIZE_BITS: usize = 9;
pub const CARD_SIZE: usize = 1 << CARD_SIZE_BITS;
pub const CARDS_PER_SEGMENT: usize = SEGMENT_SIZE / CARD_SIZE;

pub const HEADER_SIZE: usize = size_of::<usize>();

/// A free-list cell needs its header plus the link to the next free cell
pub const MIN_CELL_SIZE: usize = HEADER_SIZE + size_of::<usize>();
pub const MAX_CELL_SIZE: usize = SEGMENT_CAPACITY;

/// Cells traced by the marker per acquisition of the heap locks
pub const MARK_CHUNK: usize = 128;

pub const DEFAULT_MAX_HEAP_SIZE: usize = 64 * 1024 * 1024;
pub const DEFAULT_LARGE_OBJECT_THRESHOLD: usize = SEGMENT_CAPACITY / 2;
pub const DEFAULT_OCCUPANCY_TARGET: f64 = 0.75;

/// Round a requested payload size up to a whole, aligned cell size
pub const fn cell_size_for(payload: usize) -> usize {
    let size = (HEADER_SIZE + payload + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1);
    if size < MIN_CELL_SIZE {
        MIN_CELL_SIZE
    } else {
        size
    }
}
