//! Level-gated GC logging with boot-relative timestamps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

static VERBOSE: AtomicUsize = AtomicUsize::new(0);
static BOOT: OnceLock<Instant> = OnceLock::new();

/// Set the log verbosity. Called once from [`crate::RemSetConfig`]
/// application; levels above 0 enable `gc_log!` output.
pub fn set_verbose(level: usize) {
    BOOT.get_or_init(Instant::now);
    VERBOSE.store(level, Ordering::Relaxed);
}

#[doc(hidden)]
pub fn verbose(level: usize) -> bool {
    VERBOSE.load(Ordering::Relaxed) >= level
}

#[doc(hidden)]
pub fn boot_time_secs() -> f64 {
    BOOT.get_or_init(Instant::now).elapsed().as_secs_f64()
}

#[macro_export]
macro_rules! gc_log {
    ([$level: literal] $($arg:tt)*) => {{
        if $crate::gc_log::verbose($level) {
            eprint!("[{:.3}s][info][gc,remset] ", $crate::gc_log::boot_time_secs());
            eprintln!($($arg)*)
        }
    }};
    ($($arg:tt)*) => {{
        gc_log!([2] $($arg)*)
    }};
}
