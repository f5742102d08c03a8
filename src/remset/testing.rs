//! Shared fixture for the engine tests: a real aligned allocation carved
//! into regions, with a two-word object format the tests can parse.
//!
//! Object layout (64-bit words):
//! * header word: `size_in_bytes | flags`; bit 0 marks a reference array,
//!   bit 1 marks an unpublished (unparsable) header. Sizes are word
//!   aligned so the low bits are free.
//! * plain object: word 1 holds the slot count, slots follow.
//! * reference array: slots occupy every word after the header.

use std::sync::Arc;

use crate::args::RemSetConfig;
use crate::card::{BlockOffsetTable, CardIndex, CardTable, DirtyCardQueue, DirtyCardQueueSet, HotCardCache};
use crate::region::{HeapRegion, RegionKind, RegionManager};
use crate::util::{Address, MarkBitmap, MemRegion, BYTES_IN_WORD};
use crate::vm::{CodeRootClosure, EvacClosure, MarkController, ObjectModel};

use super::RemSet;

const REF_ARRAY: usize = 1;
const UNPARSABLE: usize = 2;
const FLAG_MASK: usize = 7;

pub(crate) struct TestObjectModel;

impl ObjectModel for TestObjectModel {
    fn size(&self, obj: Address) -> usize {
        unsafe { obj.load::<usize>() & !FLAG_MASK }
    }

    fn try_size(&self, obj: Address) -> Option<usize> {
        let header = unsafe { obj.load::<usize>() };
        if header == 0 || header & UNPARSABLE != 0 {
            None
        } else {
            Some(header & !FLAG_MASK)
        }
    }

    fn is_ref_array(&self, obj: Address) -> bool {
        unsafe { obj.load::<usize>() & REF_ARRAY != 0 }
    }

    fn iterate_slots(&self, obj: Address, f: &mut dyn FnMut(Address)) {
        if self.is_ref_array(obj) {
            let words = self.size(obj) / BYTES_IN_WORD;
            for i in 1..words {
                f(obj + i * BYTES_IN_WORD);
            }
        } else {
            let nrefs = unsafe { (obj + BYTES_IN_WORD).load::<usize>() };
            for i in 0..nrefs {
                f(obj + (2 + i) * BYTES_IN_WORD);
            }
        }
    }

    fn iterate_slots_in(&self, obj: Address, mr: MemRegion, f: &mut dyn FnMut(Address)) {
        self.iterate_slots(obj, &mut |slot| {
            if mr.contains(slot) {
                f(slot)
            }
        });
    }
}

/// An evacuation closure that records the pushed slots.
#[derive(Default)]
pub(crate) struct CollectingEvac {
    pub slots: Vec<Address>,
    pub trims: usize,
}

impl EvacClosure for CollectingEvac {
    fn push_live(&mut self, slot: Address) {
        self.slots.push(slot);
    }
    fn trim_queue_partially(&mut self) {
        self.trims += 1;
    }
}

#[derive(Default)]
pub(crate) struct CollectingCodeRoots {
    pub roots: Vec<Address>,
}

impl CodeRootClosure for CollectingCodeRoots {
    fn do_code_root(&mut self, root: Address) {
        self.roots.push(root);
    }
}

pub(crate) fn test_config() -> RemSetConfig {
    RemSetConfig {
        rs_scan_block_size: 64,
        rebuild_chunk_bytes: 4096,
        summarize_rs_stats: false,
        hot_card_cache_size: 0,
        parallel_gc_threads: 2,
        dirty_card_buffer_size: 4,
        rs_fine_capacity: 64,
        verbose: 0,
    }
}

pub(crate) struct TestHeap {
    // Keeps the heap memory alive; regions and tables point into it.
    #[allow(dead_code)]
    mem: Box<[usize]>,
    pub remset: RemSet<TestObjectModel>,
    pub mutator_queue: DirtyCardQueue,
}

impl TestHeap {
    pub fn new(n_regions: usize) -> Self {
        Self::with_config(n_regions, test_config())
    }

    pub fn with_config(n_regions: usize, config: RemSetConfig) -> Self {
        let words = ((n_regions + 1) << HeapRegion::LOG_BYTES) / BYTES_IN_WORD;
        let mem = vec![0usize; words].into_boxed_slice();
        let heap_start = Address::from_ptr(mem.as_ptr()).align_up(HeapRegion::BYTES);
        let heap_bytes = n_regions << HeapRegion::LOG_BYTES;

        let regions = Arc::new(RegionManager::new(
            heap_start,
            n_regions,
            config.rs_fine_capacity,
        ));
        let card_table = Arc::new(CardTable::new(heap_start, heap_bytes));
        let bot = Arc::new(BlockOffsetTable::new(heap_start, heap_bytes));
        let hot = Arc::new(HotCardCache::new(config.hot_card_cache_size));
        let dirty_card_queues = Arc::new(DirtyCardQueueSet::new(config.dirty_card_buffer_size));
        let into_cset_queues = Arc::new(DirtyCardQueueSet::new(config.dirty_card_buffer_size));

        let mutator_queue = DirtyCardQueue::new(&dirty_card_queues);
        let remset = RemSet::new(
            config,
            regions,
            card_table,
            bot,
            hot,
            dirty_card_queues,
            into_cset_queues,
            Arc::new(TestObjectModel),
        );
        Self {
            mem,
            remset,
            mutator_queue,
        }
    }

    pub fn region(&self, i: usize) -> &HeapRegion {
        self.remset.regions.region(i)
    }

    pub fn card_table(&self) -> &CardTable {
        &self.remset.card_table
    }

    pub fn make_old(&self, i: usize) -> &HeapRegion {
        let r = self.region(i);
        r.set_kind(RegionKind::Old);
        r
    }

    pub fn make_young(&self, i: usize) -> &HeapRegion {
        let r = self.region(i);
        r.set_kind(RegionKind::Young);
        self.card_table().mark_range_young(r.mr());
        r
    }

    fn alloc_raw(&self, region_idx: usize, size_bytes: usize, header: usize) -> Address {
        let r = self.region(region_idx);
        let obj = r.top();
        assert!(obj + size_bytes <= r.end(), "region {} full", region_idx);
        unsafe { obj.store::<usize>(size_bytes | header) };
        r.set_top(obj + size_bytes);
        self.remset.bot.note_object(obj, size_bytes);
        obj
    }

    /// Allocate a plain object with `nrefs` (initially null) slots.
    pub fn alloc_obj(&self, region_idx: usize, nrefs: usize) -> Address {
        let obj = self.alloc_raw(region_idx, (2 + nrefs) * BYTES_IN_WORD, 0);
        unsafe { (obj + BYTES_IN_WORD).store::<usize>(nrefs) };
        obj
    }

    /// Allocate a reference array with `nslots` (initially null) slots.
    pub fn alloc_array(&self, region_idx: usize, nslots: usize) -> Address {
        self.alloc_raw(region_idx, (1 + nslots) * BYTES_IN_WORD, REF_ARRAY)
    }

    /// Allocate a humongous object of `total_bytes` starting at the
    /// bottom of `start_idx`, laying out continuation regions as needed.
    /// The object is a reference array so every word is a slot.
    pub fn alloc_humongous(&self, start_idx: usize, total_bytes: usize) -> Address {
        let start = self.region(start_idx);
        debug_assert_eq!(start.top(), start.bottom());
        let obj = start.bottom();
        let end = obj + total_bytes;
        let spanned = (total_bytes + HeapRegion::BYTES - 1) >> HeapRegion::LOG_BYTES;
        start.set_kind(RegionKind::Humongous);
        start.set_top(start.end().min(end));
        for i in 1..spanned {
            let cont = self.region(start_idx + i);
            cont.set_kind(RegionKind::HumongousCont);
            cont.set_top(cont.end().min(end));
        }
        unsafe { obj.store::<usize>(total_bytes | REF_ARRAY) };
        self.remset.bot.note_object(obj, total_bytes);
        obj
    }

    pub fn slot_addr(&self, obj: Address, i: usize) -> Address {
        if TestObjectModel.is_ref_array(obj) {
            obj + (1 + i) * BYTES_IN_WORD
        } else {
            obj + (2 + i) * BYTES_IN_WORD
        }
    }

    /// Store a reference without any barrier (heap setup).
    pub fn set_ref(&self, obj: Address, i: usize, target: Address) {
        unsafe { self.slot_addr(obj, i).store::<usize>(target.as_usize()) };
    }

    /// Mutator write: store the reference, dirty the slot's card and log
    /// it the way the post-barrier would.
    pub fn write_ref(&self, obj: Address, i: usize, target: Address) -> CardIndex {
        let slot = self.slot_addr(obj, i);
        unsafe { slot.store::<usize>(target.as_usize()) };
        let card = self.card_table().index_for(slot);
        self.card_table().dirty(card);
        if self.card_table().is_dirty(card) {
            self.mutator_queue.enqueue(card);
        }
        card
    }

    /// Toggle the unparsable flag on an object's header.
    pub fn set_unparsable(&self, obj: Address, unparsable: bool) {
        unsafe {
            let header = obj.load::<usize>();
            let header = if unparsable {
                header | UNPARSABLE
            } else {
                header & !UNPARSABLE
            };
            obj.store::<usize>(header);
        }
    }

    /// Run a whole single-worker pause over `cset`.
    pub fn run_pause(&self, cset: Vec<usize>, evacuation_failed: bool) -> CollectingEvac {
        self.remset.regions.set_collection_set(cset);
        self.mutator_queue.flush();
        self.remset.prepare_for_collection();
        let mut evac = CollectingEvac::default();
        let mut code_roots = CollectingCodeRoots::default();
        self.remset
            .oops_into_collection_set(0, &mut evac, &mut code_roots);
        self.remset.cleanup_after_collection(evacuation_failed);
        self.remset.regions.clear_collection_set();
        evac
    }
}

/// A scripted marking cycle for rebuild tests.
pub(crate) struct TestMarkController {
    bitmap: MarkBitmap,
    tams: spin::Mutex<Vec<Address>>,
    tars: spin::Mutex<Vec<Option<Address>>>,
    pub aborted: std::sync::atomic::AtomicBool,
    pub yields: std::sync::atomic::AtomicUsize,
}

impl TestMarkController {
    pub fn new(heap: &TestHeap) -> Self {
        let regions = &heap.remset.regions;
        let bitmap = MarkBitmap::new(
            regions.heap_start(),
            regions.num_regions() << HeapRegion::LOG_BYTES,
        );
        let tams = (0..regions.num_regions())
            .map(|i| regions.region(i).bottom())
            .collect();
        let tars = (0..regions.num_regions())
            .map(|i| Some(regions.region(i).top()))
            .collect();
        Self {
            bitmap,
            tams: spin::Mutex::new(tams),
            tars: spin::Mutex::new(tars),
            aborted: Default::default(),
            yields: Default::default(),
        }
    }

    pub fn mark(&self, obj: Address) {
        self.bitmap.mark(obj);
    }

    pub fn set_tams(&self, region: usize, tams: Address) {
        self.tams.lock()[region] = tams;
    }

    pub fn set_tars(&self, region: usize, tars: Option<Address>) {
        self.tars.lock()[region] = tars;
    }
}

impl MarkController for TestMarkController {
    fn mark_bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    fn top_at_rebuild_start(&self, region: usize) -> Option<Address> {
        self.tars.lock()[region]
    }

    fn next_top_at_mark_start(&self, region: usize) -> Address {
        self.tams.lock()[region]
    }

    fn has_aborted(&self) -> bool {
        self.aborted.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn do_yield_check(&self, _worker: usize) {
        self.yields.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}
