//! Card geometry and card-state storage: the card table itself, the
//! block-offset table used to find the first object on a card, the
//! hot-card cache, and the dirty-card queues filled by the write barrier.

pub mod bot;
pub mod hot;
pub mod queue;
pub mod table;

pub use bot::BlockOffsetTable;
pub use hot::HotCardCache;
pub use queue::{DirtyCardQueue, DirtyCardQueueSet};
pub use table::CardTable;

/// Log bytes covered by one card
pub const LOG_BYTES_IN_CARD: usize = 9;
/// Bytes covered by one card
pub const BYTES_IN_CARD: usize = 1 << LOG_BYTES_IN_CARD;

/// Index of a card in the card table. Card 0 covers the first
/// `BYTES_IN_CARD` bytes of the committed heap.
pub type CardIndex = usize;

/// Card-state byte values. CLEAN/DIRTY/YOUNG are exclusive states written
/// by the barrier and refinement; CLAIMED is a bit OR-ed in by pause-time
/// scanning to deduplicate intersecting RSes.
pub mod state {
    pub const CLEAN: u8 = 0;
    pub const DIRTY: u8 = 1;
    pub const CLAIMED: u8 = 2;
    pub const YOUNG: u8 = 4;
}
