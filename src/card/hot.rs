use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::CardIndex;

const EMPTY: usize = usize::MAX;

/// Bounded cache of frequently redirtied cards.
///
/// Very hot cards would otherwise be refined over and over while the
/// mutator keeps dirtying them; parking them here defers the work to a
/// single in-pause refinement when the cache is drained at pause start.
///
/// `insert` either absorbs the card (headroom available, returns None) or
/// evicts the oldest resident (returns it for immediate refinement). The
/// ring cursor is a single global fetch_add, so concurrent refiners
/// cooperate without locking.
pub struct HotCardCache {
    entries: Box<[AtomicUsize]>,
    cursor: AtomicUsize,
    drain_cursor: AtomicUsize,
    use_cache: AtomicBool,
}

impl HotCardCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            0
        } else {
            capacity.next_power_of_two()
        };
        Self {
            entries: (0..capacity).map(|_| AtomicUsize::new(EMPTY)).collect(),
            cursor: AtomicUsize::new(0),
            drain_cursor: AtomicUsize::new(0),
            use_cache: AtomicBool::new(capacity != 0),
        }
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache.load(Ordering::Relaxed)
    }

    /// Temporarily toggle the cache (verification drains with it off).
    /// Returns the previous setting.
    pub fn set_use_cache(&self, enabled: bool) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        self.use_cache.swap(enabled, Ordering::Relaxed)
    }

    /// Insert a card. Returns None when the card was absorbed, otherwise
    /// the card to refine now (an evicted resident, or the argument
    /// itself when the cache is disabled).
    pub fn insert(&self, card: CardIndex) -> Option<CardIndex> {
        if !self.use_cache() {
            return Some(card);
        }
        debug_assert!(card != EMPTY);
        let mask = self.entries.len() - 1;
        let slot = self.cursor.fetch_add(1, Ordering::Relaxed) & mask;
        let prev = self.entries[slot].swap(card, Ordering::Relaxed);
        if prev == EMPTY {
            None
        } else {
            Some(prev)
        }
    }

    /// Claim the next resident card during the pause drain. Workers share
    /// the drain via an atomic cursor; None once the cache is exhausted.
    pub fn drain_next(&self) -> Option<CardIndex> {
        loop {
            let i = self.drain_cursor.fetch_add(1, Ordering::Relaxed);
            if i >= self.entries.len() {
                return None;
            }
            let prev = self.entries[i].swap(EMPTY, Ordering::Relaxed);
            if prev != EMPTY {
                return Some(prev);
            }
        }
    }

    /// Reset cursors after a pause drain.
    pub fn reset(&self) {
        for e in self.entries.iter() {
            e.store(EMPTY, Ordering::Relaxed);
        }
        self.cursor.store(0, Ordering::Relaxed);
        self.drain_cursor.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_evicts_in_fifo_order() {
        let hot = HotCardCache::new(2);
        assert_eq!(hot.insert(10), None);
        assert_eq!(hot.insert(20), None);
        assert_eq!(hot.insert(30), Some(10));
        // 30 and 20 are resident now.
        let mut drained = vec![];
        while let Some(c) = hot.drain_next() {
            drained.push(c);
        }
        drained.sort_unstable();
        assert_eq!(drained, vec![20, 30]);
    }

    #[test]
    fn disabled_cache_passes_through() {
        let hot = HotCardCache::new(0);
        assert!(!hot.use_cache());
        assert_eq!(hot.insert(5), Some(5));
        assert_eq!(hot.drain_next(), None);
    }

    #[test]
    fn reset_restores_headroom() {
        let hot = HotCardCache::new(2);
        hot.insert(1);
        hot.insert(2);
        while hot.drain_next().is_some() {}
        hot.reset();
        assert_eq!(hot.insert(3), None);
    }
}
