use std::fmt;

use super::{Address, BYTES_IN_WORD};

/// A half-open interval of heap memory `[start, end)`. Used to trim card
/// ranges against allocation frontiers and to restrict object iteration
/// to a chunk.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct MemRegion {
    start: Address,
    end: Address,
}

impl MemRegion {
    pub const EMPTY: Self = MemRegion {
        start: Address::ZERO,
        end: Address::ZERO,
    };

    pub fn new(start: Address, end: Address) -> Self {
        debug_assert!(start <= end, "invalid range [{:?}, {:?})", start, end);
        Self { start, end }
    }

    pub fn with_size(start: Address, bytes: usize) -> Self {
        Self::new(start, start + bytes)
    }

    pub const fn start(&self) -> Address {
        self.start
    }

    pub const fn end(&self) -> Address {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn byte_size(&self) -> usize {
        self.end - self.start
    }

    pub fn word_size(&self) -> usize {
        self.byte_size() >> super::LOG_BYTES_IN_WORD
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    /// Does this region fully cover `other`? An empty `other` is covered
    /// by anything.
    pub fn contains_region(&self, other: MemRegion) -> bool {
        other.is_empty() || (self.start <= other.start && other.end <= self.end)
    }

    pub fn intersection(&self, other: MemRegion) -> MemRegion {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            MemRegion { start, end }
        } else {
            MemRegion::EMPTY
        }
    }

    /// Iterate the word-aligned addresses covered by this region.
    pub fn words(&self) -> impl Iterator<Item = Address> {
        let (start, end) = (self.start, self.end);
        (start.as_usize()..end.as_usize())
            .step_by(BYTES_IN_WORD)
            .map(|a| unsafe { Address::from_usize(a) })
    }
}

impl fmt::Debug for MemRegion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.start, self.end)
    }
}
