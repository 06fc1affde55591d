use crossbeam_queue::SegQueue;

use crate::object::HeapObjectHeader;

use super::shared_vars::SharedFlag;

/// Per-thread snapshot-at-the-beginning buffer. The pre-write barrier drops
/// overwritten reference values in here while concurrent marking runs; full
/// buffers migrate to the shared completed set, which the final-mark pause
/// (or the preclean phase) drains back into the marking queues.
pub struct SatbMarkQueue {
    buf: Vec<usize>,
    active: bool,
}

impl SatbMarkQueue {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            active: false,
        }
    }

    pub const fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        if !active {
            self.buf.clear();
        }
    }

    #[inline]
    pub fn enqueue(&mut self, set: &SatbMarkQueueSet, obj: *mut HeapObjectHeader) {
        if !self.active {
            return;
        }
        if self.buf.capacity() == 0 {
            self.buf.reserve_exact(set.buffer_capacity());
        }
        self.buf.push(obj as usize);
        if self.buf.len() >= set.buffer_capacity() {
            self.flush(set);
        }
    }

    pub fn flush(&mut self, set: &SatbMarkQueueSet) {
        if self.buf.is_empty() {
            return;
        }
        let full = std::mem::take(&mut self.buf);
        set.completed.push(full);
    }
}

impl Default for SatbMarkQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared side of the SATB machinery: completed buffers queued by
/// mutators, popped by whichever GC phase drains them.
pub struct SatbMarkQueueSet {
    completed: SegQueue<Vec<usize>>,
    buffer_capacity: usize,
    all_active: SharedFlag,
}

impl SatbMarkQueueSet {
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            completed: SegQueue::new(),
            buffer_capacity,
            all_active: SharedFlag::new(),
        }
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn is_active(&self) -> bool {
        self.all_active.is_set()
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.all_active.set_cond(active);
    }

    /// Pops completed buffers and feeds every recorded reference to `f`.
    /// Returns the number of references drained.
    pub fn drain(&self, mut f: impl FnMut(*mut HeapObjectHeader)) -> usize {
        let mut drained = 0;
        while let Some(buf) = self.completed.pop() {
            drained += buf.len();
            for addr in buf {
                f(addr as *mut HeapObjectHeader);
            }
        }
        drained
    }

    pub fn is_drained(&self) -> bool {
        self.completed.is_empty()
    }

    /// Throws away any queued work, used when a cycle is abandoned wholesale.
    pub fn abandon(&self) {
        while self.completed.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inactive_queue_drops_entries() {
        let set = SatbMarkQueueSet::new(4);
        let mut q = SatbMarkQueue::new();
        q.enqueue(&set, 0x1000 as *mut HeapObjectHeader);
        q.flush(&set);
        assert!(set.is_drained());
    }

    #[test]
    fn full_buffers_migrate_to_completed_set() {
        let set = SatbMarkQueueSet::new(2);
        let mut q = SatbMarkQueue::new();
        q.set_active(true);
        q.enqueue(&set, 0x1000 as *mut HeapObjectHeader);
        assert!(set.is_drained());
        q.enqueue(&set, 0x2000 as *mut HeapObjectHeader);
        assert!(!set.is_drained());

        let mut seen = Vec::new();
        set.drain(|p| seen.push(p as usize));
        assert_eq!(seen, vec![0x1000, 0x2000]);
    }
}
