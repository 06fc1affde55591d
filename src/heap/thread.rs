use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::heap::Heap;
use super::satb_mark_queue::SatbMarkQueue;
use super::tlab::ThreadLocalAllocBuffer;

/// Per-mutator state the collector needs to reach at pauses: the TLAB to
/// retire and the SATB buffer to flush. The GC only touches these while the
/// owning thread is stopped or safe, hence the unguarded cells.
pub struct MutatorThread {
    id: u64,
    heap: *mut Heap,
    tlab: UnsafeCell<ThreadLocalAllocBuffer>,
    satb: UnsafeCell<SatbMarkQueue>,
}

unsafe impl Send for MutatorThread {}
unsafe impl Sync for MutatorThread {}

impl MutatorThread {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn heap(&self) -> &'static Heap {
        unsafe { &*self.heap }
    }

    /// Poll point; mutators call this often enough that a requested pause is
    /// never waiting long.
    #[inline]
    pub fn safepoint(&self) {
        self.heap().safepoint().poll();
    }

    /// # Safety
    /// Callers are either the owning thread or a GC thread inside a pause.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn tlab(&self) -> &mut ThreadLocalAllocBuffer {
        &mut *self.tlab.get()
    }

    /// # Safety
    /// Callers are either the owning thread or a GC thread inside a pause.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn satb_queue(&self) -> &mut SatbMarkQueue {
        &mut *self.satb.get()
    }

    /// Retires the TLAB so the region's memory above it stays untouched
    /// until the thread re-fills after the pause.
    pub(crate) unsafe fn retire_tlab(&self) {
        self.tlab().retire();
    }

    pub(crate) unsafe fn flush_satb(&self) {
        self.satb_queue().flush(self.heap().satb_queue_set());
    }
}

/// Registry of attached mutator threads, owned by the heap.
pub struct Threads {
    list: Mutex<Vec<*mut MutatorThread>>,
    next_id: AtomicU64,
}

unsafe impl Send for Threads {}
unsafe impl Sync for Threads {}

impl Threads {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn attach(&self, heap: *mut Heap) -> &'static MutatorThread {
        let thread = Box::leak(Box::new(MutatorThread {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            heap,
            tlab: UnsafeCell::new(ThreadLocalAllocBuffer::new()),
            satb: UnsafeCell::new(SatbMarkQueue::new()),
        }));
        // SATB activation raced with attach: adopt the current global state.
        unsafe {
            thread
                .satb_queue()
                .set_active((*heap).satb_queue_set().is_active());
        }
        unsafe { (*heap).safepoint().thread_attached() };
        self.list.lock().push(thread as *mut MutatorThread);
        thread
    }

    pub(crate) fn detach(&self, thread: &'static MutatorThread) {
        unsafe {
            thread.retire_tlab();
            thread.flush_satb();
        }
        let ptr = thread as *const MutatorThread as *mut MutatorThread;
        self.list.lock().retain(|&t| t != ptr);
        thread.heap().safepoint().thread_detached();
        unsafe {
            drop(Box::from_raw(ptr));
        }
    }

    /// Snapshot of the registered threads. Stable while inside a safepoint;
    /// advisory otherwise.
    pub fn get(&self) -> Vec<*mut MutatorThread> {
        self.list.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.list.lock().len()
    }
}

impl Default for Threads {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks the current mutator as safe for the duration of a blocking call, so
/// a concurrent safepoint request does not wait on it.
pub struct SafeScope<'a> {
    thread: &'a MutatorThread,
}

impl<'a> SafeScope<'a> {
    pub fn new(thread: &'a MutatorThread) -> Self {
        thread.heap().safepoint().enter_safe_region();
        Self { thread }
    }
}

impl<'a> Drop for SafeScope<'a> {
    fn drop(&mut self) {
        self.thread.heap().safepoint().leave_safe_region();
    }
}
