use std::sync::atomic::{AtomicU64, Ordering};

use crate::constants;

const BITS_PER_WORD: usize = 64;
const BITMAP_WORDS: usize = constants::WORDS_PER_SEGMENT / BITS_PER_WORD;

/// One bit per heap-aligned word of a segment. Used both for mark bits and
/// for recording where cells begin.
///
/// Bits are atomic so the mutator can read mark bits while the marker sets
/// them.
pub struct MarkBitArray {
    words: Box<[AtomicU64]>,
}

impl MarkBitArray {
    pub fn new() -> MarkBitArray {
        MarkBitArray {
            words: (0..BITMAP_WORDS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Bit index of a segment address
    pub fn index_of(addr: usize) -> usize {
        (addr & !constants::SEGMENT_PTR_MASK) >> constants::HEAP_ALIGN_BITS
    }

    /// Segment offset of a bit index
    pub fn offset_of(index: usize) -> usize {
        index << constants::HEAP_ALIGN_BITS
    }

    pub fn at(&self, index: usize) -> bool {
        let word = self.words[index / BITS_PER_WORD].load(Ordering::Acquire);
        word & (1 << (index % BITS_PER_WORD)) != 0
    }

    pub fn mark(&self, index: usize) {
        self.words[index / BITS_PER_WORD].fetch_or(1 << (index % BITS_PER_WORD), Ordering::AcqRel);
    }

    pub fn clear(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    pub fn mark_all(&self) {
        for word in self.words.iter() {
            word.store(u64::MAX, Ordering::Release);
        }
    }

    /// The highest set bit at or below `index`
    pub fn find_prev_set(&self, index: usize) -> Option<usize> {
        let mut word_index = index / BITS_PER_WORD;
        let bit = index % BITS_PER_WORD;
        // keep bits 0..=bit of the first word
        let mut word = self.words[word_index].load(Ordering::Acquire) & (u64::MAX >> (63 - bit));

        loop {
            if word != 0 {
                let top = BITS_PER_WORD - 1 - word.leading_zeros() as usize;
                return Some(word_index * BITS_PER_WORD + top);
            }
            if word_index == 0 {
                return None;
            }
            word_index -= 1;
            word = self.words[word_index].load(Ordering::Acquire);
        }
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_clear() {
        let bits = MarkBitArray::new();
        assert!(!bits.at(100));
        bits.mark(100);
        assert!(bits.at(100));
        assert!(!bits.at(101));
        assert_eq!(bits.count(), 1);
        bits.clear();
        assert!(!bits.at(100));
    }

    #[test]
    fn test_mark_all_sets_every_bit() {
        let bits = MarkBitArray::new();
        bits.mark_all();
        assert!(bits.at(0));
        assert!(bits.at(constants::WORDS_PER_SEGMENT - 1));
        assert_eq!(bits.count(), constants::WORDS_PER_SEGMENT);
    }

    #[test]
    fn test_find_prev_set_crosses_words() {
        let bits = MarkBitArray::new();
        bits.mark(2);
        bits.mark(70);
        assert_eq!(bits.find_prev_set(70), Some(70));
        assert_eq!(bits.find_prev_set(69), Some(2));
        assert_eq!(bits.find_prev_set(200), Some(70));
        assert_eq!(bits.find_prev_set(1), None);
    }

    #[test]
    fn test_index_ignores_segment_base() {
        let base = 3 * constants::SEGMENT_SIZE;
        assert_eq!(MarkBitArray::index_of(base + 16), 2);
        assert_eq!(MarkBitArray::offset_of(2), 16);
    }
}
