//! Pause-time scan of the collection-set remembered sets.
//!
//! Two passes over the CSet. In phase A each region's RS is claimed
//! whole by one worker, which drains it, scans the region's strong code
//! roots and marks the RS iteration complete. In phase B (`try_claimed`)
//! every worker may enter every region and drain whatever card blocks
//! are still unclaimed, spreading the tail of very large RSes.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::{RemSet, RsPhase};
use crate::card::CardIndex;
use crate::region::HeapRegion;
use crate::util::{MemRegion, ObjectReference};
use crate::vm::{CodeRootClosure, EvacClosure, ObjectModel, ScanOutcome};

pub(crate) struct ScanRSClosure<'a, M: ObjectModel> {
    remset: &'a RemSet<M>,
    worker: usize,
    block_size: usize,
    try_claimed: bool,
    cards_done: usize,
    cards_looked_up: usize,
    code_root_scan_time: Duration,
}

impl<'a, M: ObjectModel> ScanRSClosure<'a, M> {
    fn new(remset: &'a RemSet<M>, worker: usize) -> Self {
        Self {
            remset,
            worker,
            block_size: remset.config.rs_scan_block_size.max(1),
            try_claimed: false,
            cards_done: 0,
            cards_looked_up: 0,
            code_root_scan_time: Duration::ZERO,
        }
    }

    fn set_try_claimed(&mut self) {
        self.try_claimed = true;
    }

    /// Scan one card of a CSet region's RS. The card lives in some old
    /// region `r` outside the CSet; its memory, trimmed to the parsable
    /// frontier, is walked and every reference into the CSet is pushed
    /// to the evacuation closure.
    fn scan_card(&mut self, evac: &mut dyn EvacClosure, card: CardIndex, r: &HeapRegion) {
        // Claim lazily: RSes of CSet regions can intersect, and the
        // claimed bit keeps a shared card from being scanned twice. The
        // race on the bit is benign, the worst outcome is an extra scan.
        if !self.remset.card_table.atomic_set_claimed(card) {
            return;
        }
        let card_region = self.remset.card_table.region_for(card);
        let pre_gc_allocated = MemRegion::new(r.bottom(), r.scan_top());
        let mr = pre_gc_allocated.intersection(card_region);
        if mr.is_empty() {
            return;
        }
        self.cards_done += 1;
        let remset = self.remset;
        let outcome = remset.oops_on_card_seq_iterate_careful(r, mr, &mut |slot| {
            let t = ObjectReference::from_raw(unsafe { slot.atomic_load_word(Ordering::Relaxed) });
            if t.is_null() {
                return;
            }
            let t = t.to_address();
            if !remset.regions.contains(t) {
                return;
            }
            if remset.regions.region_containing(t).in_collection_set() {
                evac.push_live(slot);
            }
        });
        debug_assert_eq!(
            outcome,
            ScanOutcome::Complete,
            "cards trimmed to scan_top must parse"
        );
    }

    fn scan_strong_code_roots(
        &mut self,
        code_roots: &mut dyn CodeRootClosure,
        evac: &mut dyn EvacClosure,
        r: &HeapRegion,
    ) {
        let timer = Instant::now();
        r.strong_code_roots_do(&mut |root| code_roots.do_code_root(root));
        evac.trim_queue_partially();
        self.code_root_scan_time += timer.elapsed();
    }

    fn do_heap_region(
        &mut self,
        evac: &mut dyn EvacClosure,
        code_roots: &mut dyn CodeRootClosure,
        r: &HeapRegion,
    ) -> bool {
        debug_assert!(r.in_collection_set(), "should only be called on elements of CS");
        let hrrs = r.rem_set();
        if hrrs.iter_is_complete() {
            return false; // All done.
        }
        if !self.try_claimed && !hrrs.claim_iter() {
            return false;
        }
        // If we did not return above, then either we work on
        // claimed-but-not-complete regions, or we claimed the region.

        // Cards are claimed in blocks to reduce contention on the claim
        // counter while keeping progress for large RSes.
        let mut jump_to_card = hrrs.iter_claimed_next(self.block_size);
        for (current_card, card) in hrrs.cards(&self.remset.regions).enumerate() {
            if current_card >= jump_to_card + self.block_size {
                jump_to_card = hrrs.iter_claimed_next(self.block_size);
            }
            if current_card < jump_to_card {
                continue;
            }
            self.cards_looked_up += 1;

            let card_start = self.remset.card_table.addr_for(card);
            let card_region = self.remset.regions.region_containing(card_start);

            // A card in the CSet will be handled by updateRS; a card
            // still dirty will be refined (and its CSet refs pushed) by
            // updateRS too.
            if !card_region.in_collection_set() && !self.remset.card_table.is_dirty(card) {
                self.scan_card(evac, card, card_region);
            }
        }
        if !self.try_claimed {
            // Scan the strong code root list attached to the region.
            self.scan_strong_code_roots(code_roots, evac, r);
            hrrs.set_iter_complete();
        }
        false
    }
}

impl<M: ObjectModel> RemSet<M> {
    /// Scan the CSet RSes for this worker: phase A (exclusive region
    /// claims), then phase B (shared draining of leftover blocks).
    pub fn scan_rs(
        &self,
        worker: usize,
        evac: &mut dyn EvacClosure,
        code_roots: &mut dyn CodeRootClosure,
    ) {
        let timer = Instant::now();
        let mut cl = ScanRSClosure::new(self, worker);

        self.regions
            .collection_set_iterate_from(worker, self.n_workers(), |r| {
                cl.do_heap_region(evac, code_roots, r)
            });
        cl.set_try_claimed();
        self.regions
            .collection_set_iterate_from(worker, self.n_workers(), |r| {
                cl.do_heap_region(evac, code_roots, r)
            });

        let scan_time = timer.elapsed().saturating_sub(cl.code_root_scan_time);
        self.phase_times[RsPhase::ScanRS]
            .fetch_add(scan_time.as_nanos() as u64, Ordering::Relaxed);
        self.phase_times[RsPhase::CodeRoots]
            .fetch_add(cl.code_root_scan_time.as_nanos() as u64, Ordering::Relaxed);

        let cards_scanned = self.cards_scanned.read();
        debug_assert!(cards_scanned.is_some(), "scan_rs outside a prepared pause");
        if let Some(counts) = cards_scanned.as_ref() {
            counts[worker].store(cl.cards_done, Ordering::Relaxed);
        }
        gc_log!([3] "worker {}: scanned {} cards ({} looked up)",
            cl.worker, cl.cards_done, cl.cards_looked_up);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{test_config, CollectingCodeRoots, CollectingEvac, TestHeap};

    #[test]
    fn scan_pushes_cset_refs_exactly_once_per_card() {
        let h = TestHeap::new(4);
        h.make_old(0);
        h.make_old(1);
        h.make_old(2);
        // One card in region 0 referencing both CSet regions: the RSes of
        // region 1 and region 2 intersect on that card.
        let a = h.alloc_obj(0, 2);
        let b = h.alloc_obj(1, 0);
        let c = h.alloc_obj(2, 0);
        let card = h.write_ref(a, 0, b);
        h.write_ref(a, 1, c);
        h.remset.refine_card_concurrently(card, 0);
        assert!(h.region(1).rem_set().contains(card));
        assert!(h.region(2).rem_set().contains(card));

        let root = h.region(1).bottom();
        h.region(1).add_strong_code_root(root);

        let evac = h.run_pause(vec![1, 2], false);

        // The card is claimed once, and the single scan pushes both
        // slots; a rescan from the intersecting RS is deduplicated.
        let mut slots = evac.slots.clone();
        slots.sort_unstable();
        assert_eq!(slots, vec![h.slot_addr(a, 0), h.slot_addr(a, 1)]);
        assert!(h.region(1).rem_set().iter_is_complete());
        assert!(h.region(2).rem_set().iter_is_complete());
    }

    #[test]
    fn scan_skips_cards_left_dirty_for_update_rs() {
        let h = TestHeap::new(4);
        h.make_old(0);
        h.make_old(1);
        let a = h.alloc_obj(0, 1);
        let b = h.alloc_obj(1, 0);
        let slot = h.slot_addr(a, 0);
        unsafe { slot.store::<usize>(b.as_usize()) };
        let card = h.card_table().index_for(slot);
        // The RS entry exists but the card is dirty and *not* logged:
        // scanning must leave it to updateRS rather than scan it twice.
        h.region(1).rem_set().add_card(card, 0);
        h.card_table().dirty(card);

        h.remset.regions.set_collection_set(vec![1]);
        h.remset.prepare_for_collection();
        let mut evac = CollectingEvac::default();
        let mut code_roots = CollectingCodeRoots::default();
        h.remset.scan_rs(0, &mut evac, &mut code_roots);
        assert!(evac.slots.is_empty());
        h.remset.cleanup_after_collection(false);
        h.remset.regions.clear_collection_set();
    }

    #[test]
    fn scan_skips_cards_inside_the_cset() {
        let h = TestHeap::new(4);
        h.make_old(1);
        h.make_old(2);
        // An RS entry whose card lives in another CSet region: updateRS
        // territory, not scanRS.
        let a = h.alloc_obj(2, 1);
        let b = h.alloc_obj(1, 0);
        let slot = h.slot_addr(a, 0);
        unsafe { slot.store::<usize>(b.as_usize()) };
        let card = h.card_table().index_for(slot);
        h.region(1).rem_set().add_card(card, 2);

        let evac = h.run_pause(vec![1, 2], false);
        assert!(evac.slots.is_empty());
    }

    #[test]
    fn code_roots_scanned_once_in_phase_a() {
        let h = TestHeap::new(4);
        h.make_old(1);
        let root = h.region(1).bottom() + 8usize;
        h.region(1).add_strong_code_root(root);

        h.remset.regions.set_collection_set(vec![1]);
        h.remset.prepare_for_collection();
        let mut evac = CollectingEvac::default();
        let mut code_roots = CollectingCodeRoots::default();
        h.remset.oops_into_collection_set(0, &mut evac, &mut code_roots);
        h.remset.cleanup_after_collection(false);
        h.remset.regions.clear_collection_set();

        // Phase A scans them, phase B must not repeat them.
        assert_eq!(code_roots.roots, vec![root]);
        assert!(evac.trims >= 1);
    }

    #[test]
    fn two_workers_share_one_large_rs() {
        let mut config = test_config();
        config.rs_scan_block_size = 2;
        let h = TestHeap::with_config(4, config);
        h.make_old(0);
        h.make_old(1);
        // Four RS cards for one CSet region, scanned with a block size
        // of two so claims split between workers.
        let mut slots = vec![];
        for _ in 0..4 {
            let r0 = h.region(0);
            let pad = crate::card::BYTES_IN_CARD
                - (r0.top().as_usize() & (crate::card::BYTES_IN_CARD - 1));
            if pad > 0 {
                h.alloc_array(0, pad / crate::util::BYTES_IN_WORD - 1);
            }
            let src = h.alloc_obj(0, 1);
            let target = h.alloc_obj(1, 0);
            let card = h.write_ref(src, 0, target);
            slots.push(h.slot_addr(src, 0));
            h.remset.refine_card_concurrently(card, 0);
        }
        assert_eq!(h.region(1).rem_set().occupied().0, 4);

        h.remset.regions.set_collection_set(vec![1]);
        h.mutator_queue.flush();
        h.remset.prepare_for_collection();
        let pushed: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|w| {
                    let h = &h;
                    scope.spawn(move || {
                        let mut evac = CollectingEvac::default();
                        let mut code_roots = CollectingCodeRoots::default();
                        h.remset.oops_into_collection_set(w, &mut evac, &mut code_roots);
                        evac.slots
                    })
                })
                .collect();
            handles.into_iter().flat_map(|j| j.join().unwrap()).collect()
        });
        h.remset.cleanup_after_collection(false);
        h.remset.regions.clear_collection_set();

        // Every card scanned exactly once across both workers.
        let mut pushed = pushed;
        pushed.sort_unstable();
        slots.sort_unstable();
        assert_eq!(pushed, slots);
        assert!(h.region(1).rem_set().iter_is_complete());
    }
}
