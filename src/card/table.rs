use std::sync::atomic::{AtomicU8, Ordering};

use super::{state, CardIndex, BYTES_IN_CARD, LOG_BYTES_IN_CARD};
use crate::util::{Address, MemRegion};

/// One state byte per card over a contiguous committed heap range.
///
/// Mutators store DIRTY, refiners store CLEAN, pause scanning ORs in the
/// CLAIMED bit. Single-byte accesses are atomic; cross-byte ordering is
/// the refiner's problem (it fences between cleaning a card and reading
/// the memory the card covers).
pub struct CardTable {
    base: Address,
    cards: Box<[AtomicU8]>,
}

impl CardTable {
    pub fn new(heap_start: Address, heap_bytes: usize) -> Self {
        debug_assert!(heap_start.is_aligned_to(BYTES_IN_CARD));
        debug_assert!(heap_bytes % BYTES_IN_CARD == 0);
        let n = heap_bytes >> LOG_BYTES_IN_CARD;
        Self {
            base: heap_start,
            cards: (0..n).map(|_| AtomicU8::new(state::CLEAN)).collect(),
        }
    }

    pub fn num_cards(&self) -> usize {
        self.cards.len()
    }

    #[inline]
    pub fn index_for(&self, addr: Address) -> CardIndex {
        debug_assert!(addr >= self.base);
        let idx = (addr - self.base) >> LOG_BYTES_IN_CARD;
        debug_assert!(idx < self.cards.len(), "address {:?} beyond card table", addr);
        idx
    }

    #[inline]
    pub fn addr_for(&self, idx: CardIndex) -> Address {
        debug_assert!(idx < self.cards.len());
        self.base + (idx << LOG_BYTES_IN_CARD)
    }

    /// The heap range covered by a card.
    #[inline]
    pub fn region_for(&self, idx: CardIndex) -> MemRegion {
        MemRegion::with_size(self.addr_for(idx), BYTES_IN_CARD)
    }

    #[inline]
    pub fn value(&self, idx: CardIndex) -> u8 {
        self.cards[idx].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_dirty(&self, idx: CardIndex) -> bool {
        self.value(idx) == state::DIRTY
    }

    #[inline]
    pub fn is_claimed(&self, idx: CardIndex) -> bool {
        self.value(idx) & state::CLAIMED != 0
    }

    #[inline]
    pub fn is_young(&self, idx: CardIndex) -> bool {
        self.value(idx) == state::YOUNG
    }

    /// Barrier side: mark the card covering `addr` dirty. Young cards are
    /// left alone, that is the barrier's filter.
    #[inline]
    pub fn dirty(&self, idx: CardIndex) {
        if self.value(idx) != state::YOUNG {
            self.cards[idx].store(state::DIRTY, Ordering::Release);
        }
    }

    /// Refinement side: transition the card to CLEAN with a plain atomic
    /// store. The caller issues the store-load fence that orders this
    /// against reading the card's memory.
    #[inline]
    pub fn atomic_clean(&self, idx: CardIndex) {
        self.cards[idx].store(state::CLEAN, Ordering::SeqCst);
    }

    /// Redirty a card that refinement cleaned but could not parse.
    #[inline]
    pub fn redirty(&self, idx: CardIndex) {
        self.cards[idx].store(state::DIRTY, Ordering::SeqCst);
    }

    /// Scan side: set the CLAIMED bit. Returns false if the card was
    /// already claimed by another worker.
    #[inline]
    pub fn atomic_set_claimed(&self, idx: CardIndex) -> bool {
        let old = self.cards[idx].fetch_or(state::CLAIMED, Ordering::Relaxed);
        old & state::CLAIMED == 0
    }

    /// Mark every card covering `mr` as YOUNG so the barrier and
    /// refinement filter them.
    pub fn mark_range_young(&self, mr: MemRegion) {
        debug_assert!(mr.start().is_aligned_to(BYTES_IN_CARD));
        let mut idx = self.index_for(mr.start());
        let end = self.index_for(mr.end() - 1usize);
        while idx <= end {
            self.cards[idx].store(state::YOUNG, Ordering::Relaxed);
            idx += 1;
        }
    }

    /// Reset every card to CLEAN. Runs at pause cleanup; also drops any
    /// CLAIMED and YOUNG marks.
    pub fn clear_all_to_clean(&self) {
        for c in self.cards.iter() {
            c.store(state::CLEAN, Ordering::Relaxed);
        }
    }

    pub fn count_dirty(&self) -> usize {
        self.cards.iter().filter(|c| c.load(Ordering::Relaxed) == state::DIRTY).count()
    }

    pub fn assert_all_clean(&self) {
        for (i, c) in self.cards.iter().enumerate() {
            let v = c.load(Ordering::Relaxed);
            assert_eq!(v, state::CLEAN, "card {} not clean after cleanup: {}", i, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CardTable {
        let base = unsafe { Address::from_usize(0x100000) };
        CardTable::new(base, 64 << LOG_BYTES_IN_CARD)
    }

    #[test]
    fn index_addr_round_trip() {
        let ct = table();
        let a = ct.addr_for(7) + 123usize;
        assert_eq!(ct.index_for(a), 7);
        assert_eq!(ct.region_for(7).byte_size(), BYTES_IN_CARD);
    }

    #[test]
    fn claim_is_exclusive() {
        let ct = table();
        assert!(ct.atomic_set_claimed(3));
        assert!(!ct.atomic_set_claimed(3));
        assert!(ct.is_claimed(3));
        // A claimed card is no longer "dirty" for the scan-side check.
        assert!(!ct.is_dirty(3));
        ct.clear_all_to_clean();
        assert!(!ct.is_claimed(3));
    }

    #[test]
    fn young_filter() {
        let ct = table();
        let mr = MemRegion::new(ct.addr_for(4), ct.addr_for(6));
        ct.mark_range_young(mr);
        ct.dirty(4);
        assert!(ct.is_young(4));
        ct.dirty(8);
        assert!(ct.is_dirty(8));
    }
}
