use std::sync::atomic::{AtomicU8, Ordering};

use crate::constants;

const CLEAN: u8 = 0;
const DIRTY: u8 = 1;

/// One byte per 512-byte card of a segment. A dirty card may hold a pointer
/// into the young generation; young collections scan only dirty cards.
pub struct CardTable {
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    pub fn new() -> CardTable {
        CardTable {
            cards: (0..constants::CARDS_PER_SEGMENT)
                .map(|_| AtomicU8::new(CLEAN))
                .collect(),
        }
    }

    pub fn address_to_index(addr: usize) -> usize {
        (addr & !constants::SEGMENT_PTR_MASK) >> constants::CARD_SIZE_BITS
    }

    pub fn index_to_address(base: usize, index: usize) -> usize {
        base + (index << constants::CARD_SIZE_BITS)
    }

    pub fn dirty_card_for_address(&self, addr: usize) {
        self.cards[Self::address_to_index(addr)].store(DIRTY, Ordering::Relaxed);
    }

    pub fn is_card_for_address_dirty(&self, addr: usize) -> bool {
        self.is_dirty(Self::address_to_index(addr))
    }

    pub fn is_dirty(&self, index: usize) -> bool {
        self.cards[index].load(Ordering::Relaxed) == DIRTY
    }

    /// First dirty card in `from..to`
    pub fn find_next_dirty(&self, from: usize, to: usize) -> Option<usize> {
        (from..to).find(|i| self.is_dirty(*i))
    }

    /// First clean card in `from..to`
    pub fn find_next_clean(&self, from: usize, to: usize) -> Option<usize> {
        (from..to).find(|i| !self.is_dirty(*i))
    }

    pub fn clear(&self) {
        for card in self.cards.iter() {
            card.store(CLEAN, Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|c| c.load(Ordering::Relaxed) == DIRTY)
            .count()
    }
}
