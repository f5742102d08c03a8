//! The remembered-set engine façade: pause lifecycle, scrubbing, verify
//! support, and the summary counters. The heavy lifting lives in the
//! submodules: [`refine`] (card refinement), [`scan`] (pause-time RS
//! scanning) and [`rebuild`] (post-mark RS reconstruction).

pub mod rebuild;
pub mod refine;
pub mod scan;
pub mod summary;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use enum_map::EnumMap;

use crate::args::RemSetConfig;
use crate::card::{BlockOffsetTable, CardTable, DirtyCardQueueSet, HotCardCache};
use crate::region::{RegionClaimer, RegionManager};
use crate::util::{BitMap, SuspendibleSet};
use crate::vm::{CodeRootClosure, EvacClosure, ObjectModel};

pub use summary::{RemSetSummary, RsPhase};

/// The engine. One instance per heap; all shared components are injected
/// at construction.
pub struct RemSet<M: ObjectModel> {
    pub(crate) config: RemSetConfig,
    pub(crate) regions: Arc<RegionManager>,
    pub(crate) card_table: Arc<CardTable>,
    pub(crate) bot: Arc<BlockOffsetTable>,
    pub(crate) hot_card_cache: Arc<HotCardCache>,
    /// Mutator logs, drained concurrently and at pause start.
    pub(crate) dirty_card_queues: Arc<DirtyCardQueueSet>,
    /// Cards found during in-pause refinement to carry CSet references.
    /// Discarded after a successful evacuation, re-installed after a
    /// failed one.
    pub(crate) into_cset_queues: Arc<DirtyCardQueueSet>,
    pub(crate) om: Arc<M>,
    sts: SuspendibleSet,
    is_gc_active: AtomicBool,
    pub(crate) conc_refine_cards: AtomicUsize,
    /// Per-worker scan counts; allocated in prepare, freed in cleanup.
    pub(crate) cards_scanned: spin::RwLock<Option<Box<[AtomicUsize]>>>,
    total_cards_scanned: AtomicUsize,
    pub(crate) phase_times: EnumMap<RsPhase, AtomicU64>,
    prev_period_summary: spin::Mutex<RemSetSummary>,
}

impl<M: ObjectModel> RemSet<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RemSetConfig,
        regions: Arc<RegionManager>,
        card_table: Arc<CardTable>,
        bot: Arc<BlockOffsetTable>,
        hot_card_cache: Arc<HotCardCache>,
        dirty_card_queues: Arc<DirtyCardQueueSet>,
        into_cset_queues: Arc<DirtyCardQueueSet>,
        om: Arc<M>,
    ) -> Self {
        config.validate();
        crate::gc_log::set_verbose(config.verbose);
        Self {
            config,
            regions,
            card_table,
            bot,
            hot_card_cache,
            dirty_card_queues,
            into_cset_queues,
            om,
            sts: SuspendibleSet::new(),
            is_gc_active: AtomicBool::new(false),
            conc_refine_cards: AtomicUsize::new(0),
            cards_scanned: spin::RwLock::new(None),
            total_cards_scanned: AtomicUsize::new(0),
            phase_times: EnumMap::default(),
            prev_period_summary: spin::Mutex::new(RemSetSummary::default()),
        }
    }

    #[inline]
    pub fn n_workers(&self) -> usize {
        self.config.parallel_gc_threads
    }

    #[inline]
    pub(crate) fn is_gc_active(&self) -> bool {
        self.is_gc_active.load(Ordering::Relaxed)
    }

    /// The suspendible-set token concurrent work cooperates through.
    /// Refinement threads join it around buffer drains; rebuild workers
    /// join it for the whole task and yield between chunks.
    pub fn suspendible_set(&self) -> &SuspendibleSet {
        &self.sts
    }

    /// Cards turned into RS entries by concurrent refinement since
    /// construction. Early-outs (CLEAN on entry, filtered regions) do not
    /// count.
    pub fn conc_refine_cards(&self) -> usize {
        self.conc_refine_cards.load(Ordering::Relaxed)
    }

    pub fn total_cards_scanned(&self) -> usize {
        self.total_cards_scanned.load(Ordering::Relaxed)
    }

    pub(crate) fn record_phase(&self, phase: RsPhase, start: Instant) {
        self.phase_times[phase].fetch_add(start.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    // ---------- Pause lifecycle ---------- //

    /// Enter the evacuation pause. The caller has stopped the mutators
    /// and installed the collection set; concurrent refinement is refused
    /// from here until cleanup.
    pub fn prepare_for_collection(&self) {
        debug_assert!(!self.is_gc_active());
        self.is_gc_active.store(true, Ordering::SeqCst);

        // Record the parsable frontier of every region and reopen the
        // CSet RS iterators for this pause's claims.
        self.regions.iterate_all(|r| r.set_scan_top(r.top()));
        for idx in self.regions.collection_set() {
            self.regions.region(idx).rem_set().reset_iter();
        }

        self.dirty_card_queues.concatenate_logs();

        let mut cards_scanned = self.cards_scanned.write();
        debug_assert!(cards_scanned.is_none());
        *cards_scanned = Some((0..self.n_workers()).map(|_| AtomicUsize::new(0)).collect());
    }

    /// One pause worker's share of RS work: drain the remaining logged
    /// cards into RS entries (update), then scan the CSet RSes into the
    /// evacuation closure.
    pub fn oops_into_collection_set(
        &self,
        worker: usize,
        evac: &mut dyn EvacClosure,
        code_roots: &mut dyn CodeRootClosure,
    ) {
        debug_assert!(worker < self.n_workers());
        self.update_rs(worker, evac);
        self.scan_rs(worker, evac, code_roots);
    }

    /// Leave the pause. `evacuation_failed` re-installs the into-CSet
    /// cards: objects that failed to move stay where they are, and their
    /// outgoing references still need RS entries, so the cards go back
    /// through the mutator queue for the next refinement cycle.
    pub fn cleanup_after_collection(&self, evacuation_failed: bool) {
        debug_assert!(self.is_gc_active());

        let cards_scanned = self.cards_scanned.write().take();
        debug_assert!(cards_scanned.is_some());
        let total: usize = cards_scanned
            .iter()
            .flat_map(|c| c.iter())
            .map(|c| c.load(Ordering::Relaxed))
            .sum();
        self.total_cards_scanned.fetch_add(total, Ordering::Relaxed);

        self.card_table.clear_all_to_clean();
        self.hot_card_cache.reset();

        if evacuation_failed {
            // Objects that failed to move stay in place; their outgoing
            // references still need RS entries. Redirty the into-CSet
            // cards and hand them back to the mutator queue so the next
            // refinement cycle re-inserts them.
            gc_log!([2] "evacuation failed: restoring {} into-cset buffers",
                self.into_cset_queues.completed_buffers());
            while let Some(buf) = self.into_cset_queues.pop_buffer() {
                for &card in &buf {
                    self.card_table.redirty(card);
                }
                self.dirty_card_queues.enqueue_completed_buffer(buf);
            }
        } else {
            #[cfg(debug_assertions)]
            self.card_table.assert_all_clean();
        }
        self.into_cset_queues.clear();
        debug_assert_eq!(self.into_cset_queues.completed_buffers(), 0);

        self.is_gc_active.store(false, Ordering::SeqCst);
    }

    // ---------- Scrub ---------- //

    /// Drop RS entries whose sources died in the last marking cycle.
    /// Humongous continuation regions share the start region's RS and are
    /// skipped.
    pub fn scrub(&self, region_bm: &BitMap, card_bm: &BitMap) {
        self.regions.iterate_all(|r| {
            if !r.is_humongous_cont() {
                r.rem_set().scrub(region_bm, card_bm);
            }
        });
    }

    pub fn scrub_parallel(
        &self,
        region_bm: &BitMap,
        card_bm: &BitMap,
        worker: usize,
        n_workers: usize,
        claimer: &RegionClaimer,
        claim_value: usize,
    ) {
        self.regions
            .par_iterate_chunked(worker, n_workers, claimer, claim_value, |r| {
                if !r.is_humongous_cont() {
                    r.rem_set().scrub(region_bm, card_bm);
                }
            });
    }

    // ---------- Verification support ---------- //

    /// Flush and refine every logged card so verification sees a stable
    /// RS state. The hot-card cache is disabled for the drain so nothing
    /// stays parked in it.
    pub fn prepare_for_verify(&self) {
        let was_active = self.is_gc_active();
        if !was_active {
            self.is_gc_active.store(true, Ordering::SeqCst);
            self.regions.iterate_all(|r| r.set_scan_top(r.top()));
        }
        self.regions.iterate_all(|r| r.rem_set().cleanup());
        self.dirty_card_queues.concatenate_logs();

        let use_hot_card_cache = self.hot_card_cache.set_use_cache(false);
        struct Discard;
        impl EvacClosure for Discard {
            fn push_live(&mut self, _slot: crate::util::Address) {}
        }
        let mut discard = Discard;
        while let Some(card) = self.hot_card_cache.drain_next() {
            self.refine_card_during_gc(card, 0, &mut discard);
        }
        self.hot_card_cache.reset();
        while let Some(buf) = self.dirty_card_queues.pop_buffer() {
            for card in buf {
                self.refine_card_during_gc(card, 0, &mut discard);
            }
        }
        self.into_cset_queues.clear();
        self.hot_card_cache.set_use_cache(use_hot_card_cache);

        if !was_active {
            self.is_gc_active.store(false, Ordering::SeqCst);
        }
        debug_assert_eq!(self.dirty_card_queues.completed_buffers(), 0);
    }
}
