//! Engine configuration.
//!
//! Every knob can be overridden from the environment, which keeps
//! benchmarking scripts free of rebuild cycles. The struct is plain data
//! and is injected into the engine at construction; there is no global
//! options singleton.

use std::env;
use std::fmt::Debug;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct RemSetConfig {
    /// Cards per claim unit when draining a region's RS during the pause.
    pub rs_scan_block_size: usize,
    /// Bytes per chunk in the post-mark RS rebuild walk. A yield check
    /// runs between chunks.
    pub rebuild_chunk_bytes: usize,
    /// Emit a periodic RS summary from `print_periodic_summary_info`.
    pub summarize_rs_stats: bool,
    /// Capacity of the hot-card cache, rounded up to a power of two.
    /// Zero disables the cache entirely.
    pub hot_card_cache_size: usize,
    /// Width of the pause-parallel worker pool.
    pub parallel_gc_threads: usize,
    /// Cards buffered per mutator log before the buffer is published to
    /// the completed list.
    pub dirty_card_buffer_size: usize,
    /// Fine-table capacity of each per-region RS, rounded up to a power
    /// of two. When a source region overflows the table it is coarsened.
    pub rs_fine_capacity: usize,
    /// gc_log! verbosity.
    pub verbose: usize,
}

impl Default for RemSetConfig {
    fn default() -> Self {
        fn env_arg<T: FromStr + Debug>(name: &str) -> Option<T>
        where
            T::Err: Debug,
        {
            env::var(name).map(|x| T::from_str(&x).unwrap()).ok()
        }
        fn env_bool_arg(name: &str) -> Option<bool> {
            env::var(name)
                .map(|x| x == "1" || x == "true" || x == "TRUE")
                .ok()
        }
        Self {
            rs_scan_block_size: env_arg("RS_SCAN_BLOCK_SIZE").unwrap_or(64),
            rebuild_chunk_bytes: env_arg("REBUILD_CHUNK_BYTES").unwrap_or(512 << 10),
            summarize_rs_stats: env_bool_arg("SUMMARIZE_RS_STATS").unwrap_or(false),
            hot_card_cache_size: env_arg("HOT_CARD_CACHE_SIZE").unwrap_or(1024),
            parallel_gc_threads: env_arg("PARALLEL_GC_THREADS").unwrap_or_else(num_cpus::get),
            dirty_card_buffer_size: env_arg("DIRTY_CARD_BUFFER_SIZE").unwrap_or(256),
            rs_fine_capacity: env_arg("RS_FINE_CAPACITY").unwrap_or(512),
            verbose: env_arg("GC_LOG_LEVEL").unwrap_or(0),
        }
    }
}

impl RemSetConfig {
    pub fn validate(&self) {
        assert!(self.rs_scan_block_size > 0);
        assert!(self.rebuild_chunk_bytes >= crate::card::BYTES_IN_CARD);
        assert!(self.parallel_gc_threads > 0);
        assert!(self.dirty_card_buffer_size > 0);
        assert!(self.rs_fine_capacity > 0);
    }
}
