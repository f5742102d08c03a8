//! Traits through which the engine calls back into the collector: object
//! layout parsing, evacuation and code-root closures, and the concurrent
//! marking controller consulted by the RS rebuild.

use crate::util::{Address, MemRegion};

/// Result of iterating the objects on a single card. A card covering a
/// partially initialized object cannot be walked; concurrent refinement
/// reacts by redirtying the card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Complete,
    Unparsable,
}

/// Object layout, as far as the RS engine needs it: sizes for walking
/// allocation order, and reference-slot iteration. Objects are identified
/// by the address of their first word.
pub trait ObjectModel: 'static + Send + Sync {
    /// Size of the object in bytes. The heap below every region's
    /// `scan_top` is parsable, so this never fails for trimmed walks.
    fn size(&self, obj: Address) -> usize;

    /// Size of the object in bytes, or None when the header is not yet
    /// published (a stale card extending onto in-flight allocation).
    fn try_size(&self, obj: Address) -> Option<usize> {
        Some(self.size(obj))
    }

    /// Is this a reference array? Reference arrays straddling a rebuild
    /// chunk are scanned per-chunk; everything else is scanned whole.
    fn is_ref_array(&self, obj: Address) -> bool;

    /// Invoke `f` with the address of every reference slot of `obj`.
    fn iterate_slots(&self, obj: Address, f: &mut dyn FnMut(Address));

    /// Invoke `f` with the address of every reference slot of `obj` that
    /// lies within `mr`.
    fn iterate_slots_in(&self, obj: Address, mr: MemRegion, f: &mut dyn FnMut(Address));
}

/// Receives the live references discovered by the pause-time RS scan and
/// by in-pause refinement. Implemented by the collector's per-worker
/// evacuation state.
pub trait EvacClosure {
    /// A slot holding a reference into the collection set.
    fn push_live(&mut self, slot: Address);

    /// Bound the collector's copy queue; called after draining a card
    /// with CSet references and after each region's code-root scan.
    fn trim_queue_partially(&mut self) {}
}

/// Receives the strong code roots attached to a CSet region.
pub trait CodeRootClosure {
    fn do_code_root(&mut self, root: Address);
}

/// The concurrent-marking cycle, as consulted by the RS rebuild.
pub trait MarkController: Sync {
    /// The marking bitmap of the cycle being rebuilt from.
    fn mark_bitmap(&self) -> &crate::util::MarkBitmap;

    /// The region's frontier when rebuild started, or None if the region
    /// was eagerly reclaimed mid-rebuild.
    fn top_at_rebuild_start(&self, region: usize) -> Option<Address>;

    /// The region's frontier when marking started. Objects at or above it
    /// are implicitly live under SATB.
    fn next_top_at_mark_start(&self, region: usize) -> Address;

    fn has_aborted(&self) -> bool;

    /// Yield point between rebuild chunks.
    fn do_yield_check(&self, worker: usize);
}
