use std::sync::{Condvar, Mutex};

#[derive(Default)]
struct SuspendibleSetSync {
    joined: usize,
    parked: usize,
    suspend_requested: bool,
}

/// Cooperation token between long-running concurrent GC work (refinement,
/// rebuild) and safepoints. Threads doing concurrent work `join` the set;
/// a safepoint initiator calls `request_suspend` and blocks until every
/// joined thread has parked in `yield_if_requested`.
#[derive(Default)]
pub struct SuspendibleSet {
    sync: Mutex<SuspendibleSetSync>,
    cv: Condvar,
}

impl SuspendibleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self) {
        let mut s = self.sync.lock().unwrap();
        // A new joiner must not slip past an in-progress suspension.
        while s.suspend_requested {
            s = self.cv.wait(s).unwrap();
        }
        s.joined += 1;
    }

    pub fn leave(&self) {
        let mut s = self.sync.lock().unwrap();
        debug_assert!(s.joined > 0);
        s.joined -= 1;
        self.cv.notify_all();
    }

    /// Park until the suspension is over. Returns true if the thread
    /// actually yielded.
    pub fn yield_if_requested(&self) -> bool {
        let mut s = self.sync.lock().unwrap();
        if !s.suspend_requested {
            return false;
        }
        s.parked += 1;
        self.cv.notify_all();
        while s.suspend_requested {
            s = self.cv.wait(s).unwrap();
        }
        s.parked -= 1;
        true
    }

    /// Request all joined threads to park; blocks until they have.
    pub fn request_suspend(&self) {
        let mut s = self.sync.lock().unwrap();
        debug_assert!(!s.suspend_requested);
        s.suspend_requested = true;
        while s.parked < s.joined {
            s = self.cv.wait(s).unwrap();
        }
    }

    pub fn resume(&self) {
        let mut s = self.sync.lock().unwrap();
        debug_assert!(s.suspend_requested);
        s.suspend_requested = false;
        self.cv.notify_all();
    }
}
