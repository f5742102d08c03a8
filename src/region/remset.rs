use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use super::{HeapRegion, RegionManager};
use crate::card::CardIndex;
use crate::util::BitMap;

/// Fine-table slot encoding. Card 0 is a valid index, so stored values
/// are offset past the two sentinels. Tombstones keep probe chains
/// intact after scrubbing; insertion never reuses them.
const EMPTY: usize = 0;
const TOMBSTONE: usize = 1;

#[inline]
const fn encode(card: CardIndex) -> usize {
    card + 2
}

#[inline]
const fn decode(slot: usize) -> CardIndex {
    slot - 2
}

const ITER_UNCLAIMED: u8 = 0;
const ITER_CLAIMED: u8 = 1;
const ITER_COMPLETE: u8 = 2;

/// The remembered set of a single region: the cards whose covered memory
/// holds references into this region.
///
/// Two levels. The fine level is a lock-free open-addressed table of card
/// indices: refiners CAS entries in concurrently, and insertion is
/// monotonic (entries only leave through `scrub` tombstones or `clear`).
/// When a source region overflows the fine table it is *coarsened*: its
/// bit is set in a per-source-region bitmap, its fine entries are purged,
/// and iteration yields every card of that region up to its current top.
///
/// Iteration only runs at a safepoint after refiners have quiesced, so
/// the snapshot walk needs no synchronization beyond the claim counters.
pub struct PerRegionRS {
    fine: Box<[AtomicUsize]>,
    n_fine: AtomicUsize,
    coarse: BitMap,
    n_coarse: AtomicUsize,
    iter_state: AtomicU8,
    iter_claim: AtomicUsize,
}

impl PerRegionRS {
    pub fn new(n_regions: usize, fine_capacity: usize) -> Self {
        let capacity = fine_capacity.next_power_of_two();
        Self {
            fine: (0..capacity).map(|_| AtomicUsize::new(EMPTY)).collect(),
            n_fine: AtomicUsize::new(0),
            coarse: BitMap::new(n_regions),
            n_coarse: AtomicUsize::new(0),
            iter_state: AtomicU8::new(ITER_UNCLAIMED),
            iter_claim: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn slot_of(&self, card: CardIndex, probe: usize) -> usize {
        let mask = self.fine.len() - 1;
        card.wrapping_mul(0x9e37_79b9_7f4a_7c15).wrapping_add(probe) & mask
    }

    /// Record that `card` (owned by source region `src_region`) holds a
    /// reference into this RS's region. Idempotent; callable from any
    /// number of refiners concurrently.
    pub fn add_card(&self, card: CardIndex, src_region: usize) {
        debug_assert_eq!(HeapRegion::region_index_of_card(card), src_region);
        if self.coarse.get(src_region) {
            return;
        }
        let enc = encode(card);
        for probe in 0..self.fine.len() {
            let slot = &self.fine[self.slot_of(card, probe)];
            let mut v = slot.load(Ordering::Relaxed);
            loop {
                if v == enc {
                    return;
                }
                if v != EMPTY {
                    break;
                }
                match slot.compare_exchange_weak(EMPTY, enc, Ordering::Relaxed, Ordering::Relaxed) {
                    Ok(_) => {
                        self.n_fine.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    Err(cur) => v = cur,
                }
            }
        }
        self.coarsen(src_region);
    }

    /// The fine table is full: track the whole source region coarsely and
    /// purge its fine entries so they are not iterated twice.
    fn coarsen(&self, src_region: usize) {
        if self.coarse.set(src_region) {
            self.n_coarse.fetch_add(1, Ordering::Relaxed);
            gc_log!([3] "remset coarsened source region {}", src_region);
        }
        for slot in self.fine.iter() {
            let v = slot.load(Ordering::Relaxed);
            if v > TOMBSTONE && HeapRegion::region_index_of_card(decode(v)) == src_region {
                if slot
                    .compare_exchange(v, TOMBSTONE, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    self.n_fine.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Does the RS cover this card (either level)? Test-and-verify hook.
    pub fn contains(&self, card: CardIndex) -> bool {
        if self.coarse.get(HeapRegion::region_index_of_card(card)) {
            return true;
        }
        let enc = encode(card);
        for probe in 0..self.fine.len() {
            match self.fine[self.slot_of(card, probe)].load(Ordering::Relaxed) {
                v if v == enc => return true,
                EMPTY => return false,
                _ => {}
            }
        }
        false
    }

    /// Fine entries plus coarsened source regions.
    pub fn occupied(&self) -> (usize, usize) {
        (
            self.n_fine.load(Ordering::Relaxed),
            self.n_coarse.load(Ordering::Relaxed),
        )
    }

    pub fn is_empty(&self) -> bool {
        let (fine, coarse) = self.occupied();
        fine == 0 && coarse == 0
    }

    /// Drop entries whose source region or card is dead: a clear bit in
    /// `region_bm` means the source region is dead, a clear bit in
    /// `card_bm` means the card holds no live data.
    pub fn scrub(&self, region_bm: &BitMap, card_bm: &BitMap) {
        for slot in self.fine.iter() {
            let v = slot.load(Ordering::Relaxed);
            if v <= TOMBSTONE {
                continue;
            }
            let card = decode(v);
            let src = HeapRegion::region_index_of_card(card);
            if !region_bm.get(src) || !card_bm.get(card) {
                if slot
                    .compare_exchange(v, TOMBSTONE, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    self.n_fine.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
        let mut r = 0;
        while let Some(src) = self.coarse.next_set(r) {
            if !region_bm.get(src) && self.coarse.clear(src) {
                self.n_coarse.fetch_sub(1, Ordering::Relaxed);
            }
            r = src + 1;
        }
    }

    /// Rewrite the fine table without tombstones. Runs while refiners are
    /// quiesced.
    pub fn cleanup(&self) {
        let live: Vec<CardIndex> = self
            .fine
            .iter()
            .filter_map(|s| {
                let v = s.swap(EMPTY, Ordering::Relaxed);
                (v > TOMBSTONE).then(|| decode(v))
            })
            .collect();
        self.n_fine.store(0, Ordering::Relaxed);
        for card in live {
            self.add_card(card, HeapRegion::region_index_of_card(card));
        }
    }

    pub fn clear(&self) {
        for slot in self.fine.iter() {
            slot.store(EMPTY, Ordering::Relaxed);
        }
        self.coarse.clear_all();
        self.n_fine.store(0, Ordering::Relaxed);
        self.n_coarse.store(0, Ordering::Relaxed);
        self.reset_iter();
    }

    // ---------- Pause-time iteration claims ---------- //

    /// Claim the whole iteration for one worker. Single CAS from
    /// unclaimed to claimed.
    pub fn claim_iter(&self) -> bool {
        self.iter_state
            .compare_exchange(
                ITER_UNCLAIMED,
                ITER_CLAIMED,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub fn iter_is_complete(&self) -> bool {
        self.iter_state.load(Ordering::Relaxed) == ITER_COMPLETE
    }

    /// No further scanning of this RS happens in the current pause.
    pub fn set_iter_complete(&self) {
        self.iter_state.store(ITER_COMPLETE, Ordering::Relaxed);
    }

    pub fn reset_iter(&self) {
        self.iter_state.store(ITER_UNCLAIMED, Ordering::Relaxed);
        self.iter_claim.store(0, Ordering::Relaxed);
    }

    /// Claim the next block of `block_size` card positions. Monotonic.
    pub fn iter_claimed_next(&self, block_size: usize) -> usize {
        self.iter_claim.fetch_add(block_size, Ordering::Relaxed)
    }

    /// Snapshot iterator over the card indices in this RS: fine entries
    /// in slot order, then the card span of every coarsened region up to
    /// its top at iteration time.
    pub fn cards<'a>(&'a self, regions: &'a RegionManager) -> RsCardIter<'a> {
        RsCardIter {
            rs: self,
            regions,
            fine_pos: 0,
            coarse_region: 0,
            coarse_card: 0,
            coarse_end: 0,
        }
    }
}

pub struct RsCardIter<'a> {
    rs: &'a PerRegionRS,
    regions: &'a RegionManager,
    fine_pos: usize,
    coarse_region: usize,
    coarse_card: CardIndex,
    coarse_end: CardIndex,
}

impl<'a> Iterator for RsCardIter<'a> {
    type Item = CardIndex;

    fn next(&mut self) -> Option<CardIndex> {
        while self.fine_pos < self.rs.fine.len() {
            let v = self.rs.fine[self.fine_pos].load(Ordering::Relaxed);
            self.fine_pos += 1;
            if v > TOMBSTONE {
                return Some(decode(v));
            }
        }
        loop {
            if self.coarse_card < self.coarse_end {
                let card = self.coarse_card;
                self.coarse_card += 1;
                return Some(card);
            }
            let src = self.rs.coarse.next_set(self.coarse_region)?;
            self.coarse_region = src + 1;
            let r = self.regions.region(src);
            let top = r.top();
            if top == r.bottom() {
                continue;
            }
            self.coarse_card = r.first_card();
            self.coarse_end = r.first_card() + ((top - r.bottom() + crate::card::BYTES_IN_CARD - 1)
                >> crate::card::LOG_BYTES_IN_CARD);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Address;

    fn manager(n: usize) -> (Vec<u8>, RegionManager) {
        let backing = vec![0u8; (n + 1) << HeapRegion::LOG_BYTES];
        let start = Address::from_ptr(backing.as_ptr()).align_up(HeapRegion::BYTES);
        (backing, RegionManager::new(start, n, 16))
    }

    #[test]
    fn add_is_idempotent() {
        let rs = PerRegionRS::new(4, 16);
        let card = HeapRegion::CARDS; // first card of region 1
        rs.add_card(card, 1);
        rs.add_card(card, 1);
        assert_eq!(rs.occupied(), (1, 0));
        assert!(rs.contains(card));
        assert!(!rs.contains(card + 1));
    }

    #[test]
    fn overflow_coarsens_and_purges() {
        let rs = PerRegionRS::new(4, 4);
        // Region 1's cards fill the table, then one more coarsens it.
        for i in 0..5 {
            rs.add_card(HeapRegion::CARDS + i, 1);
        }
        let (fine, coarse) = rs.occupied();
        assert_eq!(coarse, 1);
        assert_eq!(fine, 0, "coarsened source region must leave no fine entries");
        // Every card of region 1 is now covered.
        assert!(rs.contains(HeapRegion::CARDS + 100));
        // Further adds for the coarsened region are no-ops.
        rs.add_card(HeapRegion::CARDS + 7, 1);
        assert_eq!(rs.occupied(), (0, 1));
    }

    #[test]
    fn iteration_covers_fine_and_coarse() {
        let (_b, m) = manager(4);
        let rs = PerRegionRS::new(4, 4);
        // A fine entry from region 2.
        rs.add_card(2 * HeapRegion::CARDS + 3, 2);
        // Coarsen region 1 with 512 bytes of allocation (one card).
        let r1 = m.region(1);
        r1.set_top(r1.bottom() + crate::card::BYTES_IN_CARD);
        for i in 0..5 {
            rs.add_card(HeapRegion::CARDS + i, 1);
        }
        let cards: Vec<_> = rs.cards(&m).collect();
        assert!(cards.contains(&(2 * HeapRegion::CARDS + 3)));
        assert!(cards.contains(&HeapRegion::CARDS));
        assert_eq!(cards.len(), 2);
    }

    #[test]
    fn scrub_drops_dead_sources() {
        let rs = PerRegionRS::new(4, 16);
        let c1 = HeapRegion::CARDS + 1;
        let c2 = 2 * HeapRegion::CARDS + 2;
        rs.add_card(c1, 1);
        rs.add_card(c2, 2);
        let region_bm = BitMap::new(4);
        let card_bm = BitMap::new(4 * HeapRegion::CARDS);
        // Region 2 lives, region 1 is dead; c2's card bit is live.
        region_bm.set(2);
        card_bm.set(c2);
        rs.scrub(&region_bm, &card_bm);
        assert!(!rs.contains(c1));
        assert!(rs.contains(c2));
        assert_eq!(rs.occupied(), (1, 0));
    }

    #[test]
    fn scrub_drops_dead_cards_of_live_regions() {
        let rs = PerRegionRS::new(4, 16);
        let c1 = HeapRegion::CARDS + 1;
        let c2 = HeapRegion::CARDS + 2;
        rs.add_card(c1, 1);
        rs.add_card(c2, 1);
        let region_bm = BitMap::new(4);
        let card_bm = BitMap::new(4 * HeapRegion::CARDS);
        region_bm.set(1);
        card_bm.set(c2);
        rs.scrub(&region_bm, &card_bm);
        assert!(!rs.contains(c1));
        assert!(rs.contains(c2));
    }

    #[test]
    fn claim_protocol() {
        let rs = PerRegionRS::new(4, 16);
        assert!(rs.claim_iter());
        assert!(!rs.claim_iter());
        assert_eq!(rs.iter_claimed_next(2), 0);
        assert_eq!(rs.iter_claimed_next(2), 2);
        assert!(!rs.iter_is_complete());
        rs.set_iter_complete();
        assert!(rs.iter_is_complete());
        rs.reset_iter();
        assert!(rs.claim_iter());
        assert_eq!(rs.iter_claimed_next(2), 0);
    }

    #[test]
    fn clear_empties_everything() {
        let rs = PerRegionRS::new(4, 4);
        for i in 0..5 {
            rs.add_card(HeapRegion::CARDS + i, 1);
        }
        rs.add_card(2, 0);
        rs.clear();
        assert!(rs.is_empty());
        assert!(!rs.contains(2));
    }

    #[test]
    fn concurrent_adds_from_two_threads() {
        let rs = PerRegionRS::new(4, 256);
        std::thread::scope(|s| {
            for t in 0..2 {
                let rs = &rs;
                s.spawn(move || {
                    for i in 0..100 {
                        // Overlapping ranges: half the adds race.
                        rs.add_card(HeapRegion::CARDS + t * 50 + i, 1);
                    }
                });
            }
        });
        assert_eq!(rs.occupied().0, 150);
    }
}
