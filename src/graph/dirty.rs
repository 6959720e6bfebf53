use crate::core::AttributeIndex;

/// Per-attribute dirty bitset sized by the owning view type's attribute
/// count, plus one aggregate "possibly dirty" flag.
///
/// Bits only accumulate during a flush cycle. [`take`](Self::take) is the
/// single clearing operation on the hot path: it snapshots and clears in
/// one step so mutations racing a flush are neither dropped nor applied
/// twice, and [`union`](Self::union) merges a taken snapshot back when the
/// flush fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyBits {
    words: Vec<u64>,
    len: usize,
    possibly_dirty: bool,
}

impl DirtyBits {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
            possibly_dirty: false,
        }
    }

    /// Set bit `index`. Out-of-range indexes are ignored.
    pub fn mark(&mut self, index: AttributeIndex) {
        if index >= self.len {
            return;
        }
        self.words[index / 64] |= 1 << (index % 64);
        self.possibly_dirty = true;
    }

    /// Mark the whole instance: aggregate flag plus every bit.
    pub fn mark_all(&mut self) {
        for (w, word) in self.words.iter_mut().enumerate() {
            let bits_here = (self.len - w * 64).min(64);
            *word = if bits_here == 64 {
                u64::MAX
            } else {
                (1u64 << bits_here) - 1
            };
        }
        self.possibly_dirty = self.len > 0;
    }

    pub fn is_dirty(&self) -> bool {
        self.possibly_dirty
    }

    pub fn is_bit_set(&self, index: AttributeIndex) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Snapshot the current bits and clear this set.
    pub fn take(&mut self) -> DirtyBits {
        let snapshot = self.clone();
        self.clear();
        snapshot
    }

    /// Merge bits from `other` back in (failure restoration path).
    pub fn union(&mut self, other: &DirtyBits) {
        for (word, other_word) in self.words.iter_mut().zip(&other.words) {
            *word |= other_word;
        }
        self.possibly_dirty |= other.possibly_dirty;
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
        self.possibly_dirty = false;
    }

    pub fn set_bits(&self) -> Vec<AttributeIndex> {
        (0..self.len).filter(|i| self.is_bit_set(*i)).collect()
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_query() {
        let mut bits = DirtyBits::new(5);
        assert!(!bits.is_dirty());
        bits.mark(2);
        assert!(bits.is_dirty());
        assert!(bits.is_bit_set(2));
        assert!(!bits.is_bit_set(1));
        assert_eq!(bits.set_bits(), vec![2]);
    }

    #[test]
    fn test_out_of_range_mark_is_ignored() {
        let mut bits = DirtyBits::new(3);
        bits.mark(17);
        assert!(!bits.is_dirty());
        assert_eq!(bits.count(), 0);
    }

    #[test]
    fn test_mark_all_covers_every_attribute() {
        let mut bits = DirtyBits::new(70);
        bits.mark_all();
        assert_eq!(bits.count(), 70);
        assert!(bits.is_bit_set(0));
        assert!(bits.is_bit_set(69));
        assert!(!bits.is_bit_set(70));
    }

    #[test]
    fn test_take_clears_and_union_restores() {
        let mut bits = DirtyBits::new(8);
        bits.mark(1);
        bits.mark(6);

        let taken = bits.take();
        assert!(!bits.is_dirty());
        assert_eq!(bits.count(), 0);
        assert_eq!(taken.set_bits(), vec![1, 6]);

        // A new mark lands while the flush is in flight, then fails.
        bits.mark(3);
        bits.union(&taken);
        assert_eq!(bits.set_bits(), vec![1, 3, 6]);
        assert!(bits.is_dirty());
    }
}
