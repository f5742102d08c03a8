//! Card refinement: turning a dirty card back into remembered-set
//! entries.
//!
//! The concurrent path runs against live mutators and carries the
//! engine's only delicate fencing: a card is atomically cleaned *before*
//! its memory is read, with a full store-load fence in between, pairing
//! with the barrier's `store slot; store DIRTY` sequence. The in-pause
//! path runs at a safepoint, trims to `scan_top` instead of `top`, and
//! additionally routes cards with CSet references to the into-CSet queue.

use std::sync::atomic::{fence, Ordering};
use std::time::Instant;

use super::{RemSet, RsPhase};
use crate::card::{state, CardIndex, DirtyCardQueue, BYTES_IN_CARD};
use crate::region::HeapRegion;
use crate::util::{Address, MemRegion, ObjectReference};
use crate::vm::{EvacClosure, ObjectModel, ScanOutcome};

impl<M: ObjectModel> RemSet<M> {
    /// Walk the objects intersecting `mr` within region `r`, applying `f`
    /// to each reference slot inside `mr`. Allocation order is recovered
    /// through the block-offset table; an unpublished object header stops
    /// the walk.
    pub(crate) fn oops_on_card_seq_iterate_careful(
        &self,
        r: &HeapRegion,
        mr: MemRegion,
        f: &mut dyn FnMut(Address),
    ) -> ScanOutcome {
        debug_assert!(!mr.is_empty());
        // A card in a humongous continuation is covered by the object
        // starting in the humongous start region.
        let bottom = if r.is_humongous_cont() {
            self.regions.humongous_start_of(r).bottom()
        } else {
            r.bottom()
        };
        let mut cur = self.bot.block_start(mr.start(), bottom);
        debug_assert!(cur <= mr.start());
        while cur < mr.end() {
            let size = match self.om.try_size(cur) {
                Some(size) => size,
                None => return ScanOutcome::Unparsable,
            };
            debug_assert!(size > 0);
            if cur + size > mr.start() {
                self.om.iterate_slots_in(cur, mr, f);
            }
            cur = cur + size;
        }
        ScanOutcome::Complete
    }

    /// Concurrent-refinement visitor: insert the slot's card into the
    /// target region's RS for every cross-region reference.
    #[inline]
    fn conc_refine_visit(&self, slot: Address) {
        let t = ObjectReference::from_raw(unsafe { slot.atomic_load_word(Ordering::Relaxed) });
        if t.is_null() {
            return;
        }
        let t = t.to_address();
        if !self.regions.contains(t) {
            return;
        }
        if (slot.as_usize() ^ t.as_usize()) >> HeapRegion::LOG_BYTES == 0 {
            // Intra-region reference, nothing to remember.
            return;
        }
        let card = self.card_table.index_for(slot);
        self.regions
            .region_containing(t)
            .rem_set()
            .add_card(card, HeapRegion::region_index_of_card(card));
    }

    /// Refine a dirty card concurrently with the mutators.
    pub fn refine_card_concurrently(&self, card: CardIndex, worker: usize) {
        debug_assert!(!self.is_gc_active(), "only call concurrently");
        let mut card = card;

        // If the card is no longer dirty, another refiner got it, or it
        // was YOUNG or CLEAN all along. Nothing to do.
        if self.card_table.value(card) != state::DIRTY {
            return;
        }

        let mut start = self.card_table.addr_for(card);
        let mut r = self.regions.region_containing(start);

        // The region type is read racily. A young card can slip past the
        // barrier's filter before the YOUNG mark lands, and a stale card
        // can name a region that was freed and recycled since it was
        // logged. Free or young: ignore. Recycled old or humongous: the
        // trimming below and the careful iteration detect staleness; at
        // worst a stale card is processed unnecessarily.
        if !r.is_old_or_humongous() {
            return;
        }

        // The hot-card cache either absorbs the card (None), or hands
        // back a card to refine now: an evicted resident, or the
        // insertion itself.
        if self.hot_card_cache.use_cache() {
            let orig = card;
            match self.hot_card_cache.insert(card) {
                None => return,
                Some(evicted) => {
                    if evicted != orig {
                        card = evicted;
                        start = self.card_table.addr_for(card);
                        r = self.regions.region_containing(start);
                        // The evicted card sat in the cache for a while;
                        // its region may have been freed meanwhile.
                        if !r.is_old_or_humongous() {
                            return;
                        }
                    }
                }
            }
        }

        // Trim to the allocated part of the region. Old-gen top is stable
        // outside a pause; humongous allocation publishes top last, so an
        // unset top shows up here as an empty intersection.
        let scan_limit = r.top();
        if scan_limit <= start {
            // Empty trimmed range: the card must be stale.
            return;
        }

        // Okay to clean and process the card now. Remaining stale cases
        // surface as iteration failure below.
        self.card_table.atomic_clean(card);

        // This fence serves two purposes. First, the card must be clean
        // before its contents are read, so a concurrent redirtying after
        // our clean is not lost. Second, reading top must complete before
        // reading contents, for synchronization with concurrent humongous
        // allocation. Top and type may be read racily with each other; we
        // need both set, in any order, to proceed.
        fence(Ordering::SeqCst);

        let end = start + BYTES_IN_CARD;
        let dirty_region = MemRegion::new(start, scan_limit.min(end));
        debug_assert!(!dirty_region.is_empty());

        let outcome =
            self.oops_on_card_seq_iterate_careful(r, dirty_region, &mut |slot| {
                self.conc_refine_visit(slot)
            });

        if outcome == ScanOutcome::Unparsable {
            // The card covered a partially initialized object: it was
            // stale, but we already cleaned it, so losing the dirty state
            // would drop an update. Redirty and re-enqueue, unless the
            // mutator beat us to it.
            if self.card_table.value(card) != state::DIRTY {
                self.card_table.redirty(card);
                self.dirty_card_queues.shared_enqueue(card);
            }
            trace!("worker {}: redirtied unparsable card {}", worker, card);
        } else {
            self.conc_refine_cards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Refine a card inside the evacuation pause. Returns whether the
    /// card holds references into the collection set; the caller then
    /// records it on the into-CSet queue.
    pub(crate) fn refine_card_during_gc(
        &self,
        card: CardIndex,
        worker: usize,
        evac: &mut dyn EvacClosure,
    ) -> bool {
        debug_assert!(self.is_gc_active(), "only call during GC");
        debug_assert!(worker < self.n_workers());

        // Covers cards already scanned as parts of the remembered sets.
        if self.card_table.value(card) != state::DIRTY {
            return false;
        }

        let start = self.card_table.addr_for(card);
        let r = self.regions.region_containing(start);
        if !r.is_old_or_humongous() {
            return false;
        }

        // Do not scan cards of CSet regions: their live content is about
        // to be evacuated, and any RS entry produced would name a moved
        // object. If evacuation fails, the into-CSet queue restores the
        // missing entries afterwards.
        if r.in_collection_set() {
            return false;
        }

        // During STW a card may extend onto a GC allocation buffer, which
        // is not parsable. Stop at scan_top rather than top.
        let scan_limit = r.scan_top();
        if scan_limit <= start {
            return false;
        }

        self.card_table.atomic_clean(card);

        let end = start + BYTES_IN_CARD;
        let dirty_region = MemRegion::new(start, scan_limit.min(end));
        debug_assert!(!dirty_region.is_empty());

        let mut has_refs_into_cset = false;
        let outcome = self.oops_on_card_seq_iterate_careful(r, dirty_region, &mut |slot| {
            let t = ObjectReference::from_raw(unsafe { slot.atomic_load_word(Ordering::Relaxed) });
            if t.is_null() {
                return;
            }
            let t = t.to_address();
            if !self.regions.contains(t) {
                return;
            }
            let tr = self.regions.region_containing(t);
            if tr.in_collection_set() {
                has_refs_into_cset = true;
                evac.push_live(slot);
                return;
            }
            if (slot.as_usize() ^ t.as_usize()) >> HeapRegion::LOG_BYTES == 0 {
                return;
            }
            let src_card = self.card_table.index_for(slot);
            tr.rem_set()
                .add_card(src_card, HeapRegion::region_index_of_card(src_card));
        });
        // Trimmed to scan_top, the heap is parsable within a safepoint.
        debug_assert_eq!(outcome, ScanOutcome::Complete);

        self.conc_refine_cards.fetch_add(1, Ordering::Relaxed);
        has_refs_into_cset
    }

    /// Drain the remaining logged cards at pause start: the hot-card
    /// cache first, then every completed buffer. Cards with CSet
    /// references go to the into-CSet queue.
    pub fn update_rs(&self, worker: usize, evac: &mut dyn EvacClosure) {
        let timer = Instant::now();
        let into_cset_dcq = DirtyCardQueue::new(&self.into_cset_queues);

        while let Some(card) = self.hot_card_cache.drain_next() {
            self.update_rs_process_card(card, worker, evac, &into_cset_dcq);
        }
        while let Some(buf) = self.dirty_card_queues.pop_buffer() {
            for card in buf {
                self.update_rs_process_card(card, worker, evac, &into_cset_dcq);
            }
        }

        into_cset_dcq.flush();
        self.record_phase(RsPhase::UpdateRS, timer);
    }

    fn update_rs_process_card(
        &self,
        card: CardIndex,
        worker: usize,
        evac: &mut dyn EvacClosure,
        into_cset_dcq: &DirtyCardQueue,
    ) {
        if self.refine_card_during_gc(card, worker, evac) {
            evac.trim_queue_partially();
            into_cset_dcq.enqueue(card);
        }
    }
}
