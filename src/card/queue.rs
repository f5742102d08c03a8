use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use super::CardIndex;

struct LocalBuf {
    cards: spin::Mutex<Vec<CardIndex>>,
}

/// A set of dirty-card logs: per-thread buffers that overflow onto a
/// shared completed-buffer list, plus a locked shared queue for the rare
/// enqueue from refinement's redirty path.
///
/// The engine owns two of these: the main set fed by the write barrier,
/// and the into-CSet set fed by in-pause refinement.
pub struct DirtyCardQueueSet {
    completed: SegQueue<Vec<CardIndex>>,
    n_completed: AtomicUsize,
    shared: spin::Mutex<Vec<CardIndex>>,
    locals: spin::Mutex<Vec<Arc<LocalBuf>>>,
    buffer_size: usize,
}

impl DirtyCardQueueSet {
    pub fn new(buffer_size: usize) -> Self {
        debug_assert!(buffer_size > 0);
        Self {
            completed: SegQueue::new(),
            n_completed: AtomicUsize::new(0),
            shared: spin::Mutex::new(vec![]),
            locals: spin::Mutex::new(vec![]),
            buffer_size,
        }
    }

    fn push_completed(&self, buf: Vec<CardIndex>) {
        if !buf.is_empty() {
            self.completed.push(buf);
            self.n_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Publish a full buffer directly onto the completed list.
    pub fn enqueue_completed_buffer(&self, buf: Vec<CardIndex>) {
        self.push_completed(buf);
    }

    /// Enqueue from a context without a local queue, under the shared
    /// queue lock. This is refinement's redirty path.
    pub fn shared_enqueue(&self, card: CardIndex) {
        let mut shared = self.shared.lock();
        shared.push(card);
        if shared.len() >= self.buffer_size {
            let buf = std::mem::take(&mut *shared);
            self.push_completed(buf);
        }
    }

    /// Move every per-thread log and the shared queue onto the completed
    /// list so a pause drain sees all of them. Runs at a safepoint.
    pub fn concatenate_logs(&self) {
        for local in self.locals.lock().iter() {
            let buf = std::mem::take(&mut *local.cards.lock());
            self.push_completed(buf);
        }
        let buf = std::mem::take(&mut *self.shared.lock());
        self.push_completed(buf);
    }

    /// Claim one completed buffer for draining.
    pub fn pop_buffer(&self) -> Option<Vec<CardIndex>> {
        let buf = self.completed.pop()?;
        self.n_completed.fetch_sub(1, Ordering::Relaxed);
        Some(buf)
    }

    pub fn completed_buffers(&self) -> usize {
        self.n_completed.load(Ordering::Relaxed)
    }

    /// Splice every completed buffer of `other` into this set.
    pub fn merge_from(&self, other: &DirtyCardQueueSet) {
        while let Some(buf) = other.pop_buffer() {
            self.push_completed(buf);
        }
    }

    /// Drop all buffered cards.
    pub fn clear(&self) {
        while self.pop_buffer().is_some() {}
        self.shared.lock().clear();
        for local in self.locals.lock().iter() {
            local.cards.lock().clear();
        }
    }
}

/// A registered handle for enqueueing dirty cards. The write barrier owns
/// one per mutator; pause refinement owns one per worker on the into-CSet
/// set.
pub struct DirtyCardQueue {
    set: Arc<DirtyCardQueueSet>,
    local: Arc<LocalBuf>,
}

impl DirtyCardQueue {
    /// Register a new thread-local queue on `set`.
    pub fn new(set: &Arc<DirtyCardQueueSet>) -> Self {
        let local = Arc::new(LocalBuf {
            cards: spin::Mutex::new(Vec::with_capacity(set.buffer_size)),
        });
        set.locals.lock().push(local.clone());
        Self {
            set: set.clone(),
            local,
        }
    }

    pub fn enqueue(&self, card: CardIndex) {
        let mut cards = self.local.cards.lock();
        cards.push(card);
        if cards.len() >= self.set.buffer_size {
            let buf = std::mem::take(&mut *cards);
            drop(cards);
            self.set.push_completed(buf);
        }
    }

    pub fn flush(&self) {
        let buf = std::mem::take(&mut *self.local.cards.lock());
        self.set.push_completed(buf);
    }
}

impl Drop for DirtyCardQueue {
    fn drop(&mut self) {
        self.flush();
        let mut locals = self.set.locals.lock();
        if let Some(pos) = locals.iter().position(|l| Arc::ptr_eq(l, &self.local)) {
            locals.swap_remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_buffers_flush_on_overflow() {
        let set = Arc::new(DirtyCardQueueSet::new(2));
        let q = DirtyCardQueue::new(&set);
        q.enqueue(1);
        assert_eq!(set.completed_buffers(), 0);
        q.enqueue(2);
        assert_eq!(set.completed_buffers(), 1);
        q.enqueue(3);
        set.concatenate_logs();
        let mut all: Vec<_> = std::iter::from_fn(|| set.pop_buffer()).flatten().collect();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[test]
    fn merge_and_clear() {
        let a = Arc::new(DirtyCardQueueSet::new(4));
        let b = Arc::new(DirtyCardQueueSet::new(4));
        b.shared_enqueue(7);
        b.concatenate_logs();
        a.merge_from(&b);
        assert_eq!(b.completed_buffers(), 0);
        assert_eq!(a.pop_buffer(), Some(vec![7]));
        a.shared_enqueue(9);
        a.clear();
        a.concatenate_logs();
        assert!(a.pop_buffer().is_none());
    }
}
