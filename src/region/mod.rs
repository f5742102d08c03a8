//! The heap-region model consumed by the RS engine: region metadata with
//! racily readable type and frontier fields, the region manager with its
//! CSet and parallel iteration schemes, and the per-region remembered set.

pub mod remset;

pub use remset::PerRegionRS;

use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;

use crate::card::{CardIndex, LOG_BYTES_IN_CARD};
use crate::util::{Address, MemRegion};
use std::sync::atomic::{AtomicBool, AtomicUsize};

/// Region type. Type transitions happen concurrently with refinement;
/// readers tolerate staleness.
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Clone, Copy, NoUninit)]
pub enum RegionKind {
    Free = 0,
    Young = 1,
    Old = 2,
    Humongous = 3,
    HumongousCont = 4,
}

impl RegionKind {
    #[inline]
    pub fn is_old_or_humongous(&self) -> bool {
        matches!(
            self,
            RegionKind::Old | RegionKind::Humongous | RegionKind::HumongousCont
        )
    }
}

/// A fixed-size heap region.
pub struct HeapRegion {
    index: usize,
    bottom: Address,
    kind: Atomic<RegionKind>,
    /// Allocation frontier. May move concurrently with refinement;
    /// humongous allocation publishes it last.
    top: Atomic<Address>,
    /// Frontier safe to scan during the pause: excludes GC-thread-local
    /// allocation buffer tails, which are not parsable.
    scan_top: Atomic<Address>,
    in_cset: AtomicBool,
    /// Live bytes below TAMS as recorded by the marking cycle. The
    /// rebuild cross-checks its own accounting against this.
    next_marked_bytes: AtomicUsize,
    code_roots: spin::Mutex<Vec<Address>>,
    rem_set: PerRegionRS,
}

impl HeapRegion {
    /// Log bytes in region
    pub const LOG_BYTES: usize = 20;
    /// Bytes in region
    pub const BYTES: usize = 1 << Self::LOG_BYTES;
    /// Cards in region
    pub const CARDS: usize = Self::BYTES >> LOG_BYTES_IN_CARD;

    fn new(index: usize, bottom: Address, n_regions: usize, rs_fine_capacity: usize) -> Self {
        debug_assert!(bottom.is_aligned_to(Self::BYTES));
        Self {
            index,
            bottom,
            kind: Atomic::new(RegionKind::Free),
            top: Atomic::new(bottom),
            scan_top: Atomic::new(bottom),
            in_cset: AtomicBool::new(false),
            next_marked_bytes: AtomicUsize::new(0),
            code_roots: spin::Mutex::new(vec![]),
            rem_set: PerRegionRS::new(n_regions, rs_fine_capacity),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub const fn bottom(&self) -> Address {
        self.bottom
    }

    #[inline]
    pub const fn end(&self) -> Address {
        self.bottom.add(Self::BYTES)
    }

    /// The whole committed extent of the region.
    #[inline]
    pub fn mr(&self) -> MemRegion {
        MemRegion::new(self.bottom, self.end())
    }

    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.kind.load(Ordering::Relaxed)
    }

    pub fn set_kind(&self, kind: RegionKind) {
        self.kind.store(kind, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_old_or_humongous(&self) -> bool {
        self.kind().is_old_or_humongous()
    }

    #[inline]
    pub fn is_humongous_start(&self) -> bool {
        self.kind() == RegionKind::Humongous
    }

    #[inline]
    pub fn is_humongous_cont(&self) -> bool {
        self.kind() == RegionKind::HumongousCont
    }

    #[inline]
    pub fn top(&self) -> Address {
        self.top.load(Ordering::SeqCst)
    }

    pub fn set_top(&self, top: Address) {
        debug_assert!(top >= self.bottom && top <= self.end());
        self.top.store(top, Ordering::SeqCst);
    }

    #[inline]
    pub fn scan_top(&self) -> Address {
        self.scan_top.load(Ordering::Relaxed)
    }

    pub fn set_scan_top(&self, scan_top: Address) {
        self.scan_top.store(scan_top, Ordering::Relaxed);
    }

    #[inline]
    pub fn in_collection_set(&self) -> bool {
        self.in_cset.load(Ordering::Relaxed)
    }

    pub fn set_in_collection_set(&self, in_cset: bool) {
        self.in_cset.store(in_cset, Ordering::Relaxed);
    }

    pub fn next_marked_bytes(&self) -> usize {
        self.next_marked_bytes.load(Ordering::Relaxed)
    }

    pub fn set_next_marked_bytes(&self, bytes: usize) {
        self.next_marked_bytes.store(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn rem_set(&self) -> &PerRegionRS {
        &self.rem_set
    }

    /// Index of the first card covering this region. Card indices are
    /// relative to the heap start, so this is a pure function of the
    /// region index.
    #[inline]
    pub fn first_card(&self) -> CardIndex {
        self.index * Self::CARDS
    }

    /// The region holding the card: the inverse of `first_card`.
    #[inline]
    pub fn region_index_of_card(card: CardIndex) -> usize {
        card >> (Self::LOG_BYTES - LOG_BYTES_IN_CARD)
    }

    pub fn add_strong_code_root(&self, root: Address) {
        self.code_roots.lock().push(root);
    }

    pub fn strong_code_roots_do(&self, f: &mut dyn FnMut(Address)) {
        for r in self.code_roots.lock().iter() {
            f(*r);
        }
    }

    /// Return the region to the free state, dropping its RS and roots.
    /// Stale dirty cards for the old contents may survive on the card
    /// table; refinement filters them by region type.
    pub fn reclaim(&self) {
        self.set_kind(RegionKind::Free);
        self.set_top(self.bottom);
        self.set_scan_top(self.bottom);
        self.set_in_collection_set(false);
        self.set_next_marked_bytes(0);
        self.code_roots.lock().clear();
        self.rem_set.clear();
    }
}

impl std::fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Region#{}({:?},[{:?},{:?}))",
            self.index,
            self.kind(),
            self.bottom,
            self.end()
        )
    }
}

/// One atomic claim token per region. A pass hands out a fresh claim
/// value; `claim` wins each region for exactly one worker of that pass.
pub struct RegionClaimer {
    claims: Box<[AtomicUsize]>,
}

impl RegionClaimer {
    pub const UNCLAIMED: usize = 0;

    pub fn new(n_regions: usize) -> Self {
        Self {
            claims: (0..n_regions).map(|_| AtomicUsize::new(Self::UNCLAIMED)).collect(),
        }
    }

    pub fn claim(&self, region: usize, claim_value: usize) -> bool {
        debug_assert!(claim_value != Self::UNCLAIMED);
        let c = &self.claims[region];
        if c.load(Ordering::Relaxed) == claim_value {
            return false;
        }
        c.swap(claim_value, Ordering::Relaxed) != claim_value
    }
}

/// The region array over a contiguous, region-aligned heap range.
pub struct RegionManager {
    heap_start: Address,
    regions: Box<[HeapRegion]>,
    cset: spin::Mutex<Vec<usize>>,
}

impl RegionManager {
    pub fn new(heap_start: Address, n_regions: usize, rs_fine_capacity: usize) -> Self {
        debug_assert!(heap_start.is_aligned_to(HeapRegion::BYTES));
        let regions = (0..n_regions)
            .map(|i| {
                HeapRegion::new(
                    i,
                    heap_start + (i << HeapRegion::LOG_BYTES),
                    n_regions,
                    rs_fine_capacity,
                )
            })
            .collect();
        Self {
            heap_start,
            regions,
            cset: spin::Mutex::new(vec![]),
        }
    }

    pub fn heap_start(&self) -> Address {
        self.heap_start
    }

    pub fn heap_end(&self) -> Address {
        self.heap_start + (self.regions.len() << HeapRegion::LOG_BYTES)
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.heap_start && addr < self.heap_end()
    }

    #[inline]
    pub fn region(&self, index: usize) -> &HeapRegion {
        &self.regions[index]
    }

    #[inline]
    pub fn region_containing(&self, addr: Address) -> &HeapRegion {
        debug_assert!(self.contains(addr), "{:?} outside the heap", addr);
        &self.regions[(addr - self.heap_start) >> HeapRegion::LOG_BYTES]
    }

    /// The humongous start region for an address anywhere in a humongous
    /// object, walking back over continuation regions.
    pub fn humongous_start_of<'a>(&'a self, r: &'a HeapRegion) -> &'a HeapRegion {
        let mut idx = r.index;
        while self.regions[idx].is_humongous_cont() {
            debug_assert!(idx > 0);
            idx -= 1;
        }
        &self.regions[idx]
    }

    /// Install the collection set for the upcoming pause.
    pub fn set_collection_set(&self, regions: Vec<usize>) {
        let mut cset = self.cset.lock();
        debug_assert!(cset.is_empty(), "collection set already installed");
        for &i in &regions {
            self.regions[i].set_in_collection_set(true);
        }
        *cset = regions;
    }

    pub fn clear_collection_set(&self) {
        let mut cset = self.cset.lock();
        for &i in cset.iter() {
            self.regions[i].set_in_collection_set(false);
        }
        cset.clear();
    }

    pub fn collection_set(&self) -> Vec<usize> {
        self.cset.lock().clone()
    }

    /// Iterate the collection set starting at an offset proportional to
    /// the worker id, wrapping around. Spreads workers over different
    /// regions so their RS claims rarely collide. `f` returns true to
    /// stop early.
    pub fn collection_set_iterate_from(
        &self,
        worker: usize,
        n_workers: usize,
        mut f: impl FnMut(&HeapRegion) -> bool,
    ) {
        let cset = self.collection_set();
        if cset.is_empty() {
            return;
        }
        debug_assert!(n_workers > 0);
        let start = cset.len() * worker / n_workers;
        for i in 0..cset.len() {
            let r = &self.regions[cset[(start + i) % cset.len()]];
            if f(r) {
                return;
            }
        }
    }

    pub fn iterate_all(&self, mut f: impl FnMut(&HeapRegion)) {
        for r in self.regions.iter() {
            f(r);
        }
    }

    /// Worker-parallel iteration with a claim value per pass: each worker
    /// walks all regions from its own offset and processes the ones it
    /// claims.
    pub fn par_iterate_chunked(
        &self,
        worker: usize,
        n_workers: usize,
        claimer: &RegionClaimer,
        claim_value: usize,
        mut f: impl FnMut(&HeapRegion),
    ) {
        let n = self.regions.len();
        let start = n * worker / n_workers.max(1);
        for i in 0..n {
            let idx = (start + i) % n;
            if claimer.claim(idx, claim_value) {
                f(&self.regions[idx]);
            }
        }
    }

    /// Claim-based iteration for gang tasks (rebuild): `f` returns true
    /// to abort the whole iteration.
    pub fn iterate_from_worker_offset(
        &self,
        worker: usize,
        n_workers: usize,
        claimer: &RegionClaimer,
        mut f: impl FnMut(&HeapRegion) -> bool,
    ) {
        let n = self.regions.len();
        let start = n * worker / n_workers.max(1);
        for i in 0..n {
            let idx = (start + i) % n;
            if claimer.claim(idx, 1) && f(&self.regions[idx]) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(n: usize) -> (Vec<u8>, RegionManager) {
        // A dummy aligned range; these tests never dereference it.
        let backing = vec![0u8; (n + 1) << HeapRegion::LOG_BYTES];
        let start = Address::from_ptr(backing.as_ptr()).align_up(HeapRegion::BYTES);
        (backing, RegionManager::new(start, n, 64))
    }

    #[test]
    fn region_lookup() {
        let (_b, m) = manager(4);
        let r = m.region(2);
        assert_eq!(m.region_containing(r.bottom() + 100usize).index(), 2);
        assert_eq!(HeapRegion::region_index_of_card(r.first_card()), 2);
    }

    #[test]
    fn humongous_start_walkback() {
        let (_b, m) = manager(4);
        m.region(1).set_kind(RegionKind::Humongous);
        m.region(2).set_kind(RegionKind::HumongousCont);
        m.region(3).set_kind(RegionKind::HumongousCont);
        assert_eq!(m.humongous_start_of(m.region(3)).index(), 1);
        assert_eq!(m.humongous_start_of(m.region(1)).index(), 1);
    }

    #[test]
    fn claimer_is_exclusive_per_pass() {
        let c = RegionClaimer::new(3);
        assert!(c.claim(0, 1));
        assert!(!c.claim(0, 1));
        // A new pass value re-opens the region.
        assert!(c.claim(0, 2));
    }

    #[test]
    fn cset_iteration_visits_all_from_offset() {
        let (_b, m) = manager(4);
        m.set_collection_set(vec![0, 2, 3]);
        let mut seen = vec![];
        m.collection_set_iterate_from(1, 2, |r| {
            seen.push(r.index());
            false
        });
        assert_eq!(seen.len(), 3);
        assert!(seen.contains(&0) && seen.contains(&2) && seen.contains(&3));
        m.clear_collection_set();
        assert!(!m.region(2).in_collection_set());
    }
}
