#![allow(clippy::upper_case_acronyms)]

//! Remembered-set engine for a region-based garbage collector.
//!
//! A region-based heap evacuates only a subset of its regions (the
//! *collection set*) during a pause. To find the references into an
//! evacuated region without scanning the whole heap, every region keeps a
//! remembered set (RS) of incoming cross-region references at card
//! granularity. This crate is the subsystem that maintains those sets:
//!
//! * Card refinement ([`remset::refine`]): turns write-barrier dirtied
//!   cards into RS entries, concurrently with the mutators or in parallel
//!   at the start of an evacuation pause.
//! * RS scanning ([`remset::scan`]): drains the RSes of the collection-set
//!   regions during the pause and feeds the discovered references to the
//!   evacuation closure.
//! * RS rebuild ([`remset::rebuild`]): reconstructs the RSes of old
//!   regions from the mark bitmap after a concurrent marking cycle.
//!
//! The heap model itself (object layout, marking, evacuation policy) is
//! supplied by the collector through the traits in [`vm`]. All shared
//! components (card table, hot-card cache, dirty-card queues) are injected
//! into the [`RemSet`] façade at construction; the crate keeps no
//! process-global engine state.

#[macro_use]
extern crate log;

#[macro_use]
pub mod gc_log;

pub mod args;
pub mod card;
pub mod region;
pub mod remset;
pub mod util;
pub mod vm;

pub use crate::args::RemSetConfig;
pub use crate::remset::RemSet;
pub use crate::util::{Address, MemRegion, ObjectReference};
