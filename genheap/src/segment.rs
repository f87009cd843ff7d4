use std::sync::atomic::{AtomicUsize, Ordering};

use blockalloc::{Block, BlockError};

use crate::bitmap::MarkBitArray;
use crate::cardtable::CardTable;
use crate::cell::{word_at, CellKind, CellRef, Header, HeapSlot, SlotAcceptor};
use crate::constants;
use crate::rawptr::CellPtr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Generation {
    Young,
    Old,
}

/// Side tables for a segment. A pointer to this struct is placed in the very
/// first word of the segment memory so that it can be found from any cell
/// address by masking.
pub(crate) struct SegmentMeta {
    pub base: usize,
    pub generation: Generation,
    pub mark_bits: MarkBitArray,
    pub cell_heads: MarkBitArray,
    pub cards: CardTable,
}

impl SegmentMeta {
    /// Look up the metadata of the segment containing `addr`. Unsafe because
    /// the address must lie inside a segment that is still alive.
    pub unsafe fn of<'a>(addr: usize) -> &'a SegmentMeta {
        let base = addr & constants::SEGMENT_PTR_MASK;
        &*(word_at(base).load(Ordering::Acquire) as *const SegmentMeta)
    }

    pub fn is_marked(&self, cell: CellPtr) -> bool {
        self.mark_bits.at(MarkBitArray::index_of(cell.as_word()))
    }

    pub fn mark(&self, cell: CellPtr) {
        self.mark_bits.mark(MarkBitArray::index_of(cell.as_word()))
    }
}

/// What a sweep of one segment reclaimed
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub(crate) struct SweepResult {
    pub freed_bytes: usize,
    pub freed_cells: usize,
    pub finalized: usize,
}

/// A segment of heap. Space is handed out by advancing `level` until the
/// first cell is reclaimed, after which the segment switches for good to a
/// first-fit free list.
pub(crate) struct HeapSegment {
    block: Block,
    meta: Box<SegmentMeta>,
    level: AtomicUsize,
    freelist_head: usize,
    allocated_bytes: usize,
    bump_mode: bool,
}

impl HeapSegment {
    /// Create a new segment and its metadata, placing a pointer to the
    /// metadata in the first word of the segment.
    pub fn new(generation: Generation) -> Result<HeapSegment, BlockError> {
        let block = Block::new(constants::SEGMENT_SIZE)?;
        let base = block.base();

        let meta = Box::new(SegmentMeta {
            base,
            generation,
            mark_bits: MarkBitArray::new(),
            cell_heads: MarkBitArray::new(),
            cards: CardTable::new(),
        });
        unsafe { word_at(base) }.store(&*meta as *const SegmentMeta as usize, Ordering::Release);

        log::trace!("new {:?} segment at {:#x}", generation, base);

        Ok(HeapSegment {
            block,
            meta,
            level: AtomicUsize::new(base + constants::FIRST_CELL_OFFSET),
            freelist_head: 0,
            allocated_bytes: 0,
            bump_mode: true,
        })
    }

    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    pub fn base(&self) -> usize {
        self.block.base()
    }

    pub fn start(&self) -> usize {
        self.base() + constants::FIRST_CELL_OFFSET
    }

    pub fn end(&self) -> usize {
        self.block.limit()
    }

    pub fn level(&self) -> usize {
        self.level.load(Ordering::Acquire)
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.block.contains(addr)
    }

    pub fn used(&self) -> usize {
        self.level() - self.start()
    }

    pub fn available(&self) -> usize {
        self.end() - self.level()
    }

    #[cfg(test)]
    pub fn is_bump_mode(&self) -> bool {
        self.bump_mode
    }

    /// Live bytes. In bump mode everything below the level counts.
    pub fn allocated_bytes(&self) -> usize {
        if self.bump_mode {
            self.used()
        } else {
            self.allocated_bytes
        }
    }

    /// Advance the level by `size` bytes. Only one thread may allocate from a
    /// segment at a time; the young generation relies on the mutator being
    /// that thread, old segments are behind the old generation lock.
    pub fn bump_alloc(&self, size: usize) -> Option<CellPtr> {
        debug_assert!(size % constants::HEAP_ALIGN == 0);
        let level = self.level.load(Ordering::Relaxed);
        if size > self.end() - level {
            return None;
        }
        self.level.store(level + size, Ordering::Release);
        Some(CellPtr::from_addr(level))
    }

    /// Empty the segment. Used for the young generation after evacuation.
    pub fn reset_level(&self) {
        self.level.store(self.start(), Ordering::Release);
    }

    /// Allocate `size` bytes, returning the cell and the number of bytes it
    /// actually occupies: a free cell too small to split is handed out whole.
    pub fn alloc(&mut self, size: usize) -> Option<(CellPtr, usize)> {
        if self.bump_mode {
            let cell = self.bump_alloc(size)?;
            self.set_cell_head(cell.as_word());
            Some((cell, size))
        } else {
            self.freelist_alloc(size)
        }
    }

    fn freelist_alloc(&mut self, size: usize) -> Option<(CellPtr, usize)> {
        let mut prev: usize = 0;
        let mut current = self.freelist_head;

        while current != 0 {
            let cell = CellRef::new(CellPtr::from_addr(current));
            debug_assert_eq!(cell.kind(), CellKind::Freelist);
            let cell_size = cell.size();
            let next = cell.raw(0);

            if cell_size >= size {
                let remainder = cell_size - size;
                let (taken, replacement) = if remainder >= constants::MIN_CELL_SIZE {
                    let rest = current + size;
                    write_free_cell(rest, remainder, next);
                    self.set_cell_head(rest);
                    (size, rest)
                } else {
                    (cell_size, next)
                };

                if prev == 0 {
                    self.freelist_head = replacement;
                } else {
                    CellRef::new(CellPtr::from_addr(prev)).set_raw(0, replacement);
                }

                self.allocated_bytes += taken;
                return Some((cell.ptr(), taken));
            }

            prev = current;
            current = next;
        }

        None
    }

    /// Switch to free-list allocation, turning the space above the level into
    /// one free cell
    pub fn transition_to_freelist(&mut self) {
        debug_assert!(self.bump_mode);
        self.allocated_bytes = self.used();
        self.bump_mode = false;

        let tail = self.available();
        if tail >= constants::MIN_CELL_SIZE {
            if let Some(cell) = self.bump_alloc(tail) {
                let addr = cell.as_word();
                write_free_cell(addr, tail, self.freelist_head);
                self.set_cell_head(addr);
                self.freelist_head = addr;
            }
        }
    }

    /// Return a dead cell's space to the free list
    pub fn add_cell_to_freelist(&mut self, addr: usize, size: usize) {
        debug_assert!(!self.bump_mode);
        write_free_cell(addr, size, self.freelist_head);
        self.freelist_head = addr;
        self.allocated_bytes -= size;
    }

    fn set_cell_head(&self, addr: usize) {
        self.meta.cell_heads.mark(MarkBitArray::index_of(addr));
    }

    /// The cell containing `addr`
    pub fn cell_head(&self, addr: usize) -> CellPtr {
        match self.meta.cell_heads.find_prev_set(MarkBitArray::index_of(addr)) {
            Some(index) => CellPtr::from_addr(self.base() + MarkBitArray::offset_of(index)),
            None => panic!("no cell head at or below {:#x}", addr),
        }
    }

    /// Visit every cell from the start of the segment up to the level,
    /// free-list cells included
    pub fn for_each_cell<F>(&self, mut f: F)
    where
        F: FnMut(CellRef),
    {
        let stop = self.level();
        let mut addr = self.start();
        while addr < stop {
            let cell = CellRef::new(CellPtr::from_addr(addr));
            let size = checked_cell_size(cell);
            f(cell);
            addr += size;
        }
    }

    /// Every slot lying on a dirty card. A cell straddling the edge of a dirty
    /// range only contributes the slots inside the range.
    pub fn dirty_card_slots(&self) -> Vec<HeapSlot> {
        let mut slots = Vec::new();
        let level = self.level();
        if level == self.start() {
            return slots;
        }

        let cards = &self.meta.cards;
        let to = CardTable::address_to_index(level - 1) + 1;
        let mut from = CardTable::address_to_index(self.start());

        while let Some(first_dirty) = cards.find_next_dirty(from, to) {
            let first_clean = cards.find_next_clean(first_dirty, to).unwrap_or(to);
            let begin = CardTable::index_to_address(self.base(), first_dirty);
            let end = CardTable::index_to_address(self.base(), first_clean);
            let boundary = end.min(level);

            let mut range = RangeSlots {
                begin,
                end,
                slots: &mut slots,
            };
            let mut addr = self.cell_head(begin.max(self.start())).as_word();
            while addr < boundary {
                let cell = CellRef::new(CellPtr::from_addr(addr));
                let size = checked_cell_size(cell);
                cell.trace(&mut range);
                addr += size;
            }

            from = first_clean;
        }

        slots
    }

    /// Reclaim every unmarked cell, running `finalize` on those that carry a
    /// finalizer. Mark bits are left alone.
    pub fn sweep<F>(&mut self, mut finalize: F) -> SweepResult
    where
        F: FnMut(CellRef),
    {
        let mut result = SweepResult::default();
        let stop = self.level();
        let mut addr = self.start();

        while addr < stop {
            let cell = CellRef::new(CellPtr::from_addr(addr));
            let size = checked_cell_size(cell);
            let header = cell.header();

            if header.kind() != CellKind::Freelist && !self.meta.is_marked(cell.ptr()) {
                if header.has_finalizer() {
                    finalize(cell);
                    result.finalized += 1;
                }
                if self.bump_mode {
                    self.transition_to_freelist();
                }
                self.add_cell_to_freelist(addr, size);
                result.freed_bytes += size;
                result.freed_cells += 1;
            }

            addr += size;
        }

        result
    }
}

/// Collects the slots of a cell that fall inside `begin..end`
struct RangeSlots<'a> {
    begin: usize,
    end: usize,
    slots: &'a mut Vec<HeapSlot>,
}

impl<'a> SlotAcceptor for RangeSlots<'a> {
    fn accept(&mut self, slot: HeapSlot) {
        if slot.addr() >= self.begin && slot.addr() < self.end {
            self.slots.push(slot);
        }
    }
}

fn write_free_cell(addr: usize, size: usize, next: usize) {
    let cell = CellRef::new(CellPtr::from_addr(addr));
    cell.set_header(Header::new(CellKind::Freelist, size, false));
    cell.set_raw(0, next);
}

fn checked_cell_size(cell: CellRef) -> usize {
    let size = cell.size();
    if size < constants::MIN_CELL_SIZE || size % constants::HEAP_ALIGN != 0 {
        panic!("invalid cell size {} at {:?}", size, cell.ptr());
    }
    size
}
