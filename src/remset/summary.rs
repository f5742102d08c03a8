//! RS statistics: per-phase times and periodic/cumulative summaries.

use std::sync::atomic::Ordering;

use enum_map::{Enum, EnumMap};

use super::RemSet;
use crate::vm::ObjectModel;

/// Pause and rebuild phases tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum RsPhase {
    UpdateRS,
    ScanRS,
    CodeRoots,
    Rebuild,
}

/// A snapshot of the engine's counters. Periodic reporting subtracts the
/// previous snapshot to show the delta for the period.
#[derive(Debug, Default, Clone)]
pub struct RemSetSummary {
    pub conc_refine_cards: usize,
    pub total_cards_scanned: usize,
    /// Fine RS entries over all regions.
    pub fine_entries: usize,
    /// Coarsened (source region, RS) pairs over all regions.
    pub coarse_entries: usize,
    /// Regions whose RS is non-empty.
    pub occupied_regions: usize,
    pub phase_times_ms: EnumMap<RsPhase, u64>,
}

impl RemSetSummary {
    pub fn snapshot<M: ObjectModel>(remset: &RemSet<M>) -> Self {
        let mut fine_entries = 0;
        let mut coarse_entries = 0;
        let mut occupied_regions = 0;
        remset.regions.iterate_all(|r| {
            let (fine, coarse) = r.rem_set().occupied();
            fine_entries += fine;
            coarse_entries += coarse;
            if fine + coarse > 0 {
                occupied_regions += 1;
            }
        });
        let mut phase_times_ms = EnumMap::default();
        for (phase, ns) in remset.phase_times.iter() {
            phase_times_ms[phase] = ns.load(Ordering::Relaxed) / 1_000_000;
        }
        Self {
            conc_refine_cards: remset.conc_refine_cards(),
            total_cards_scanned: remset.total_cards_scanned(),
            fine_entries,
            coarse_entries,
            occupied_regions,
            phase_times_ms,
        }
    }

    /// Turn this snapshot into the delta `other - self`. Monotonic
    /// counters subtract; RS occupancy is a point-in-time value and is
    /// taken from `other` as-is.
    pub fn subtract_from(&mut self, other: &RemSetSummary) {
        self.conc_refine_cards = other.conc_refine_cards - self.conc_refine_cards;
        self.total_cards_scanned = other.total_cards_scanned - self.total_cards_scanned;
        self.fine_entries = other.fine_entries;
        self.coarse_entries = other.coarse_entries;
        self.occupied_regions = other.occupied_regions;
        for (phase, ms) in self.phase_times_ms.iter_mut() {
            *ms = other.phase_times_ms[phase] - *ms;
        }
    }

    pub fn print_on(&self, header: &str) {
        gc_log!([1] "{}", header);
        gc_log!([1] "  refined cards: {} scanned cards: {}",
            self.conc_refine_cards, self.total_cards_scanned);
        gc_log!([1] "  rs occupancy: {} fine, {} coarse over {} regions",
            self.fine_entries, self.coarse_entries, self.occupied_regions);
        for (phase, ms) in self.phase_times_ms.iter() {
            gc_log!([1] "  {:?}: {} ms", phase, ms);
        }
    }
}

impl<M: ObjectModel> RemSet<M> {
    /// Emit the delta of the RS counters since the previous periodic
    /// snapshot. Gated on the `summarize_rs_stats` knob.
    pub fn print_periodic_summary_info(&self, header: &str) {
        if !self.config.summarize_rs_stats {
            return;
        }
        let current = RemSetSummary::snapshot(self);
        let mut prev = self.prev_period_summary.lock();
        let mut delta = prev.clone();
        delta.subtract_from(&current);
        delta.print_on(header);
        *prev = current;
    }

    /// Emit the cumulative RS counters.
    pub fn print_summary_info(&self) {
        RemSetSummary::snapshot(self).print_on(" Cumulative RS summary");
    }
}
