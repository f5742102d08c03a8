use atomic::{Atomic, Ordering};

use super::{CardIndex, BYTES_IN_CARD, LOG_BYTES_IN_CARD};
use crate::util::Address;

/// Block-offset table: for each card, the start address of the object
/// whose extent covers the card's first word. Updated by the allocator,
/// consulted by card scanning and the rebuild walk to find where object
/// iteration must begin.
///
/// Slots of cards that no object extent has reached yet hold zero; a
/// query walks back to the nearest recorded start, bounded by the
/// caller-supplied region bottom.
pub struct BlockOffsetTable {
    base: Address,
    slots: Box<[Atomic<Address>]>,
}

impl BlockOffsetTable {
    pub fn new(heap_start: Address, heap_bytes: usize) -> Self {
        debug_assert!(heap_start.is_aligned_to(BYTES_IN_CARD));
        let n = heap_bytes >> LOG_BYTES_IN_CARD;
        Self {
            base: heap_start,
            slots: (0..n).map(|_| Atomic::new(Address::ZERO)).collect(),
        }
    }

    #[inline]
    pub fn index_for(&self, addr: Address) -> CardIndex {
        (addr - self.base) >> LOG_BYTES_IN_CARD
    }

    #[inline]
    pub fn address_for_index(&self, idx: CardIndex) -> Address {
        self.base + (idx << LOG_BYTES_IN_CARD)
    }

    /// Record a freshly allocated object `[start, start + bytes)`: every
    /// card whose first word the object covers now maps back to `start`.
    pub fn note_object(&self, start: Address, bytes: usize) {
        let end = start + bytes;
        let mut idx = self.index_for(start.align_up(BYTES_IN_CARD));
        while idx < self.slots.len() && self.address_for_index(idx) < end {
            self.slots[idx].store(start, Ordering::Release);
            idx += 1;
        }
    }

    /// Start of the object intersecting `addr`. `bottom` bounds the
    /// backward walk: the containing region's bottom (or the humongous
    /// start region's bottom when `addr` is in a continuation region).
    pub fn block_start(&self, addr: Address, bottom: Address) -> Address {
        debug_assert!(addr >= bottom);
        let first = self.index_for(bottom);
        let mut idx = self.index_for(addr);
        loop {
            let s = self.slots[idx].load(Ordering::Acquire);
            if !s.is_zero() && s <= addr {
                return s;
            }
            if idx == first {
                // Nothing recorded below: allocation starts at bottom.
                return bottom;
            }
            idx -= 1;
        }
    }

    /// Forget the range `[start, end)` when a region is recycled.
    pub fn clear_range(&self, start: Address, end: Address) {
        let mut idx = self.index_for(start);
        let last = self.index_for(end - 1usize);
        while idx <= last {
            self.slots[idx].store(Address::ZERO, Ordering::Relaxed);
            idx += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_start_walks_back() {
        let base = unsafe { Address::from_usize(0x200000) };
        let bot = BlockOffsetTable::new(base, 16 << LOG_BYTES_IN_CARD);
        // One object from mid-card 0 spanning through card 2.
        let obj = base + 0x40usize;
        bot.note_object(obj, 2 * BYTES_IN_CARD);
        assert_eq!(bot.block_start(base + BYTES_IN_CARD, base), obj);
        assert_eq!(bot.block_start(base + 2 * BYTES_IN_CARD - 8usize, base), obj);
        // Below the first recorded card the walk bottoms out.
        assert_eq!(bot.block_start(base + 0x20usize, base), base);
    }
}
