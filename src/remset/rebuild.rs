//! Post-mark remembered-set rebuild.
//!
//! After a concurrent marking cycle the RSes of old regions are
//! reconstructed from scratch: every live object is walked and a card is
//! re-inserted for each of its references into another old or humongous
//! region. Liveness below TAMS comes from the mark bitmap; everything
//! allocated during marking (between TAMS and TARS) is live under SATB.
//! The walk is chunked, yielding to safepoints between chunks.

use std::sync::atomic::Ordering;
use std::time::Instant;

use super::{RemSet, RsPhase};
use crate::region::{HeapRegion, RegionClaimer};
use crate::util::{Address, MarkBitmap, MemRegion, ObjectReference};
use crate::vm::{MarkController, ObjectModel};

/// Iterator over the live objects within a chunk, skipping dead objects
/// below TAMS via the mark bitmap.
struct LiveObjIter<'a, M: ObjectModel> {
    bitmap: &'a MarkBitmap,
    tams: Address,
    mr: MemRegion,
    cur: Address,
    om: &'a M,
}

impl<'a, M: ObjectModel> LiveObjIter<'a, M> {
    fn new(
        bitmap: &'a MarkBitmap,
        tams: Address,
        mr: MemRegion,
        first_obj_into_mr: Address,
        om: &'a M,
    ) -> Self {
        debug_assert!(
            first_obj_into_mr <= mr.start(),
            "first object {:?} should extend into {:?}",
            first_obj_into_mr,
            mr
        );
        let mut it = Self {
            bitmap,
            tams,
            mr,
            cur: first_obj_into_mr,
            om,
        };
        if it.is_live(it.cur) {
            // A non-array object reaching into the chunk was already
            // scanned whole by the previous chunk; step past it. Arrays
            // are scanned per-chunk and must stay current.
            if it.cur < it.mr.start() && !it.om.is_ref_array(it.cur) {
                it.cur = it.cur + it.om.size(it.cur);
                it.move_if_below_tams();
            }
        } else {
            // Dead objects can only sit below TAMS; use the bitmap.
            it.cur = it.bitmap.next_marked(it.cur, it.bitmap_limit());
            debug_assert!(
                it.cur == it.mr.end() || it.is_live(it.cur),
                "current {:?} should be live or the chunk end",
                it.cur
            );
        }
        it
    }

    #[inline]
    fn is_live(&self, obj: Address) -> bool {
        obj >= self.tams || self.bitmap.is_marked(obj)
    }

    #[inline]
    fn bitmap_limit(&self) -> Address {
        self.tams.min(self.mr.end())
    }

    fn move_if_below_tams(&mut self) {
        if self.cur < self.tams && self.has_next() {
            self.cur = self.bitmap.next_marked(self.cur, self.bitmap_limit());
        }
    }

    #[inline]
    fn has_next(&self) -> bool {
        self.cur < self.mr.end()
    }

    #[inline]
    fn next_obj(&self) -> Address {
        debug_assert!(self.is_live(self.cur));
        self.cur
    }

    fn move_to_next(&mut self) {
        self.cur = self.cur + self.om.size(self.cur);
        self.move_if_below_tams();
    }
}

impl<M: ObjectModel> RemSet<M> {
    /// Rebuild visitor: re-insert `src_card` into the RS of the region
    /// the slot's referent lives in, for cross-region references into
    /// old or humongous regions.
    #[inline]
    fn rebuild_visit(&self, src_card: usize, slot: Address) {
        let t = ObjectReference::from_raw(unsafe { slot.atomic_load_word(Ordering::Relaxed) });
        if t.is_null() {
            return;
        }
        let t = t.to_address();
        if !self.regions.contains(t) {
            return;
        }
        if (slot.as_usize() ^ t.as_usize()) >> HeapRegion::LOG_BYTES == 0 {
            return;
        }
        let tr = self.regions.region_containing(t);
        if !tr.is_old_or_humongous() {
            return;
        }
        tr.rem_set()
            .add_card(src_card, HeapRegion::region_index_of_card(src_card));
    }

    /// Apply the rebuild visitor to the references of `obj`, limiting
    /// reference arrays to the chunk. Returns the bytes attributed to
    /// this chunk for the marked-bytes accounting.
    fn scan_for_references(&self, obj: Address, mr: MemRegion) -> usize {
        let size = self.om.size(obj);
        let obj_mr = MemRegion::with_size(obj, size);
        // Non-arrays and arrays wholly inside the chunk are scanned in
        // one go; arrays crossing the chunk are resumed by later chunks.
        if !self.om.is_ref_array(obj) || mr.contains_region(obj_mr) {
            self.om
                .iterate_slots(obj, &mut |slot| {
                    self.rebuild_visit(self.card_table.index_for(slot), slot)
                });
            size
        } else {
            self.om
                .iterate_slots_in(obj, mr, &mut |slot| {
                    self.rebuild_visit(self.card_table.index_for(slot), slot)
                });
            mr.intersection(obj_mr).byte_size()
        }
    }

    /// Rebuild within one chunk of a region. Returns the live bytes below
    /// TAMS seen in this chunk.
    fn rebuild_rem_set_in_region(
        &self,
        bitmap: &MarkBitmap,
        tams: Address,
        tars: Address,
        r: &HeapRegion,
        mr: MemRegion,
    ) -> usize {
        if r.is_humongous_start() {
            let humongous_obj = r.bottom();
            // A humongous object is live if marked, or if allocated
            // during marking (TARS above TAMS). TAMS is either bottom or
            // the object end; it cannot point into the object.
            if bitmap.is_marked(humongous_obj) || tars > tams {
                // The whole object is recorded under its starting card,
                // wherever in the spanned regions a reference sits.
                let src_card = self.card_table.index_for(humongous_obj);
                self.om
                    .iterate_slots_in(humongous_obj, mr, &mut |slot| {
                        self.rebuild_visit(src_card, slot)
                    });
                if tams != r.bottom() {
                    mr.byte_size()
                } else {
                    0
                }
            } else {
                0
            }
        } else {
            let first_obj = self.bot.block_start(mr.start(), r.bottom());
            let mut marked_bytes = 0;
            let mut it = LiveObjIter::new(bitmap, tams, mr, first_obj, &*self.om);
            while it.has_next() {
                let obj = it.next_obj();
                let scanned = self.scan_for_references(obj, mr);
                if obj < tams {
                    marked_bytes += scanned;
                }
                it.move_to_next();
            }
            marked_bytes
        }
    }

    /// Rebuild one region's incoming-reference records, chunk by chunk.
    /// Returns true if the marking cycle aborted.
    fn rebuild_region(&self, ctl: &dyn MarkController, r: &HeapRegion, worker: usize) -> bool {
        if ctl.has_aborted() {
            return true;
        }
        // Continuations are covered by the walk from the humongous start
        // region.
        if r.is_humongous_cont() {
            return false;
        }

        let region_idx = r.index();
        let bitmap = ctl.mark_bitmap();
        let tams = ctl.next_top_at_mark_start(region_idx);
        let chunk_bytes = self.config.rebuild_chunk_bytes;

        let mut total_marked_bytes = 0usize;
        let mut cur = r.bottom();
        loop {
            // TARS is re-read every chunk (yield point): eager reclaim
            // during rebuild clears it, and we must exit cleanly then.
            let tars = match ctl.top_at_rebuild_start(region_idx) {
                None => return false,
                Some(t) => t,
            };
            debug_assert!(tars >= tams, "TARS {:?} below TAMS {:?}", tars, tams);

            let next_chunk = MemRegion::new(r.bottom(), tars)
                .intersection(MemRegion::with_size(cur, chunk_bytes));
            if next_chunk.is_empty() {
                break;
            }

            let timer = Instant::now();
            let marked_bytes =
                self.rebuild_rem_set_in_region(bitmap, tams, tars, r, next_chunk);
            gc_log!([4] "rebuilt chunk {:?} of region {} marked-bytes {} in {:?}",
                next_chunk, region_idx, marked_bytes, timer.elapsed());

            total_marked_bytes += marked_bytes;
            cur = cur + chunk_bytes;

            ctl.do_yield_check(worker);
            if ctl.has_aborted() {
                return true;
            }
        }

        // The region might have been eagerly reclaimed in the final
        // chunk; only cross-check the accounting if it survived.
        debug_assert!(
            ctl.top_at_rebuild_start(region_idx).is_none()
                || total_marked_bytes == r.next_marked_bytes(),
            "marked bytes {} for region {} do not match recorded next_marked_bytes {}",
            total_marked_bytes,
            region_idx,
            r.next_marked_bytes()
        );
        // Abort state may have changed after the yield check.
        ctl.has_aborted()
    }

    /// Rebuild the remembered sets of all regions with a gang of
    /// workers. Each worker joins the suspendible set so the task
    /// cooperates with safepoints, and claims regions from a worker
    /// offset to spread the initial placement.
    pub fn rebuild_rem_set(
        &self,
        ctl: &dyn MarkController,
        n_workers: usize,
        worker_id_offset: usize,
    ) {
        debug_assert!(n_workers > 0);
        let timer = Instant::now();
        let claimer = RegionClaimer::new(self.regions.num_regions());
        std::thread::scope(|scope| {
            for w in 0..n_workers {
                let claimer = &claimer;
                scope.spawn(move || {
                    let sts = self.suspendible_set();
                    sts.join();
                    self.regions
                        .iterate_from_worker_offset(w, n_workers, claimer, |r| {
                            self.rebuild_region(ctl, r, worker_id_offset + w)
                        });
                    sts.leave();
                });
            }
        });
        self.record_phase(RsPhase::Rebuild, timer);
        gc_log!([2] "remset rebuild with {} workers took {:?}", n_workers, timer.elapsed());
    }
}
