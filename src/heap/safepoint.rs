use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use super::heap::Heap;
use super::thread::MutatorThread;

struct SafepointState {
    active: bool,
    running: usize,
}

/// Cooperative stop-the-world synchronization over the heap's registered
/// mutator threads. Mutators poll [`Safepoint::poll`] at allocation sites and
/// wrap any blocking section in a safe region; the control thread (or
/// whoever drives a collection) is not registered and therefore never counts
/// toward the running set.
pub struct Safepoint {
    armed: AtomicBool,
    lock: Mutex<SafepointState>,
    cv_mutators: Condvar,
    cv_gc: Condvar,
}

impl Safepoint {
    pub fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            lock: Mutex::new(SafepointState {
                active: false,
                running: 0,
            }),
            cv_mutators: Condvar::new(),
            cv_gc: Condvar::new(),
        }
    }

    pub fn is_at_safepoint(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    pub(crate) fn thread_attached(&self) {
        let mut state = self.lock.lock();
        // A freshly attached thread starts running; it must not sneak past an
        // in-progress stop, so it waits like a polling thread would.
        while state.active {
            self.cv_mutators.wait(&mut state);
        }
        state.running += 1;
    }

    pub(crate) fn thread_detached(&self) {
        let mut state = self.lock.lock();
        state.running -= 1;
        self.cv_gc.notify_all();
    }

    /// Fast-path check for mutators; blocks while a stop-the-world operation
    /// is in progress.
    #[inline]
    pub fn poll(&self) {
        if !self.armed.load(Ordering::Relaxed) {
            return;
        }
        self.block();
    }

    #[cold]
    fn block(&self) {
        let mut state = self.lock.lock();
        if !state.active {
            return;
        }
        state.running -= 1;
        self.cv_gc.notify_all();
        while state.active {
            self.cv_mutators.wait(&mut state);
        }
        state.running += 1;
    }

    /// Marks the current mutator as safe to ignore for the duration of a
    /// blocking section.
    pub(crate) fn enter_safe_region(&self) {
        let mut state = self.lock.lock();
        state.running -= 1;
        self.cv_gc.notify_all();
    }

    pub(crate) fn leave_safe_region(&self) {
        let mut state = self.lock.lock();
        while state.active {
            self.cv_mutators.wait(&mut state);
        }
        state.running += 1;
    }

    fn begin(&self) {
        let mut state = self.lock.lock();
        assert!(!state.active, "nested safepoint request");
        state.active = true;
        self.armed.store(true, Ordering::Release);
        while state.running > 0 {
            self.cv_gc.wait(&mut state);
        }
    }

    fn end(&self) {
        let mut state = self.lock.lock();
        debug_assert!(state.active);
        state.active = false;
        self.armed.store(false, Ordering::Release);
        self.cv_mutators.notify_all();
    }
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Collector-facing entry points, mirroring the usual begin/end bracket.
pub struct SafepointSynchronize;

impl SafepointSynchronize {
    /// Stops all registered mutators and returns the stopped set. Only one
    /// thread may drive safepoints at a time (the control thread, or a test
    /// driving collections synchronously).
    pub fn begin(heap: &Heap) -> Vec<*mut MutatorThread> {
        let start = std::time::Instant::now();
        heap.safepoint().begin();
        let threads = heap.threads().get();
        log::debug!(
            target: "gc-safepoint",
            "stopped the world ({} thread(s)) in {:.3} ms",
            threads.len(),
            start.elapsed().as_micros() as f64 / 1000.0
        );
        threads
    }

    pub fn end(heap: &Heap) {
        heap.safepoint().end();
    }

    pub fn is_at_safepoint(heap: &Heap) -> bool {
        heap.safepoint().is_at_safepoint()
    }
}
