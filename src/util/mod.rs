pub mod address;
pub mod bitmap;
pub mod mem_region;
pub mod sts;

pub use address::{Address, ByteOffset, ByteSize, ObjectReference};
pub use bitmap::{BitMap, MarkBitmap};
pub use mem_region::MemRegion;
pub use sts::SuspendibleSet;

/// log2 of bytes in a heap word
pub const LOG_BYTES_IN_WORD: usize = 3;
/// Bytes in a heap word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
