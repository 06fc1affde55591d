use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::utils::formatted_size;

use super::concurrent_gc::ConcurrentGC;
use super::degenerated_gc::DegeneratedGC;
use super::full_gc::FullGC;
use super::heap::Heap;
use super::shared_vars::SharedFlag;
use super::{AllocRequest, DegenPoint, GCCause};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum GCMode {
    None,
    Concurrent,
    STWDegen,
    STWFull,
}

/// The single thread that sequences collections: it arbitrates between
/// allocation-failure handling, explicit requests and heuristic triggers,
/// runs the chosen collector, and wakes whoever was blocked on the outcome.
/// It is the only thread that ever requests safepoints.
pub struct ControlThread {
    heap: *mut Heap,

    should_terminate: AtomicBool,
    has_terminated: AtomicBool,

    gc_requested: SharedFlag,
    alloc_failure_gc: SharedFlag,
    heap_changed: SharedFlag,

    terminator_lock: Mutex<()>,
    terminator_cond: Condvar,

    alloc_failure_waiters: Mutex<()>,
    alloc_failure_cond: Condvar,
    gc_waiters: Mutex<()>,
    gc_waiters_cond: Condvar,
}

unsafe impl Send for ControlThread {}
unsafe impl Sync for ControlThread {}

impl ControlThread {
    pub fn new(heap: *mut Heap) -> &'static Self {
        let thread = Box::leak(Box::new(Self {
            heap,
            should_terminate: AtomicBool::new(false),
            has_terminated: AtomicBool::new(false),
            gc_requested: SharedFlag::new(),
            alloc_failure_gc: SharedFlag::new(),
            heap_changed: SharedFlag::new(),
            terminator_lock: Mutex::new(()),
            terminator_cond: Condvar::new(),
            alloc_failure_waiters: Mutex::new(()),
            alloc_failure_cond: Condvar::new(),
            gc_waiters: Mutex::new(()),
            gc_waiters_cond: Condvar::new(),
        }));

        let ptr = thread as *const ControlThread as usize;
        std::thread::Builder::new()
            .name("rbgc-control".to_string())
            .spawn(move || {
                let controller = unsafe { &*(ptr as *const ControlThread) };
                controller.run_service();
                let lock = controller.terminator_lock.lock();
                controller.has_terminated.store(true, Ordering::Release);
                drop(lock);
                controller.terminator_cond.notify_all();
            })
            .expect("failed to spawn GC control thread");

        thread
    }

    fn heap(&self) -> &'static Heap {
        unsafe { &*self.heap }
    }

    pub fn notify_heap_changed(&self) {
        if self.heap_changed.is_unset() {
            self.heap_changed.set();
        }
    }

    pub fn get_gc_id(&self) -> usize {
        self.heap().gc_id()
    }

    /// Called by a mutator whose allocation failed: flags the failure,
    /// cancels the concurrent cycle, and blocks until the control thread has
    /// collected. The caller wraps this in a safe scope.
    pub fn handle_alloc_failure_gc(&self, heap: &Heap, req: &AllocRequest) {
        if self.alloc_failure_gc.try_set() {
            log::info!(
                target: "gc",
                "Failed to allocate {}",
                formatted_size(req.size())
            );
            heap.cancel_gc(GCCause::AllocFailure);
        }

        let mut guard = self.alloc_failure_waiters.lock();
        while self.alloc_failure_gc.is_set() {
            self.alloc_failure_cond.wait(&mut guard);
        }
    }

    /// Wakes mutators that failed allocation; invoked by the service loop
    /// after a collection.
    fn notify_alloc_failure_waiters(&self) {
        self.alloc_failure_gc.unset();
        let guard = self.alloc_failure_waiters.lock();
        drop(guard);
        self.alloc_failure_cond.notify_all();
    }

    /// Explicit collection request: blocks until one whole GC has run past
    /// the request.
    pub fn handle_requested_gc(&self, _heap: &Heap) {
        let mut guard = self.gc_waiters.lock();
        let current_gc_id = self.get_gc_id();
        let required_gc_id = current_gc_id + 1;
        while self.get_gc_id() < required_gc_id {
            self.gc_requested.set();
            self.gc_waiters_cond.wait(&mut guard);
        }
    }

    fn notify_gc_waiters(&self) {
        self.gc_requested.unset();
        let guard = self.gc_waiters.lock();
        drop(guard);
        self.gc_waiters_cond.notify_all();
    }

    fn run_service(&self) {
        let heap = self.heap();
        let mut last_sleep_adjust_time = Instant::now();
        let mut last_shrink_time = Instant::now();

        // Poll for shrinkable regions at a tenth of the uncommit delay, so
        // the actual uncommit lags the deadline by at most that much.
        let shrink_period = heap.options().uncommit_delay as f64 / 1000.0 / 10.0;
        let mut sleep = heap.options().control_interval_min;

        while !self.should_terminate() {
            let alloc_failure_pending = self.alloc_failure_gc.is_set();
            let explicit_gc_requested = self.gc_requested.is_set();

            let mut mode = GCMode::None;

            if alloc_failure_pending {
                log::info!(target: "gc", "Trigger: Handle allocation failure");
                heap.heuristics_mut().record_allocation_failure_gc();
                // An evacuation that already failed its allocation can only
                // be repaired by the full collection.
                if heap.cancelled_cause() != GCCause::EvacOom && heap.should_degenerate_cycle() {
                    mode = GCMode::STWDegen;
                } else {
                    mode = GCMode::STWFull;
                }
            } else if explicit_gc_requested {
                log::info!(target: "gc", "Trigger: Explicit GC request");
                if heap.options().explicit_gc_concurrent {
                    mode = GCMode::Concurrent;
                } else {
                    mode = GCMode::STWFull;
                }
            } else if heap.should_start_gc() {
                mode = GCMode::Concurrent;
            }

            if heap.options().always_full && mode != GCMode::None {
                mode = GCMode::STWFull;
            }

            if mode != GCMode::None {
                heap.update_gc_id();
                heap.set_allocated(0);
                heap.heuristics_mut().record_cycle_start();

                heap.lock();
                heap.free_set().log_status();
                heap.unlock();

                self.run_collection(mode);

                heap.heuristics_mut().record_cycle_end();

                if explicit_gc_requested {
                    self.notify_gc_waiters();
                }
                if alloc_failure_pending {
                    self.notify_alloc_failure_waiters();
                }

                heap.lock();
                heap.free_set().log_status();
                heap.unlock();
            }

            let current = Instant::now();

            if heap.options().uncommit
                && (explicit_gc_requested
                    || (current - last_shrink_time).as_secs_f64() > shrink_period)
            {
                // Explicit GC shrinks eagerly; the periodic service only
                // uncommits regions that sat empty past the delay.
                let shrink_before = if explicit_gc_requested {
                    current
                } else {
                    current - Duration::from_millis(heap.options().uncommit_delay as u64)
                };
                self.service_uncommit(shrink_before);
                last_shrink_time = current;
            }

            // Back off exponentially while idle; snap back to the minimum
            // interval whenever the heap changed.
            if self.heap_changed.try_unset() {
                sleep = heap.options().control_interval_min;
            } else if (current - last_sleep_adjust_time).as_millis() as usize
                > heap.options().control_interval_adjust_period
            {
                last_sleep_adjust_time = current;
                sleep = heap.options().control_interval_max.min(1.max(sleep * 2));
            }

            std::thread::sleep(Duration::from_millis(sleep as u64));
        }

        log::debug!(target: "gc", "Controller thread terminated");
    }

    /// Runs one collection in the requested mode, including the degeneration
    /// and escalation ladder.
    fn run_collection(&self, mode: GCMode) {
        let heap = self.heap();
        match mode {
            GCMode::Concurrent => {
                let mut collector = ConcurrentGC::new(heap);
                if collector.collect() {
                    heap.heuristics_mut().record_success_concurrent();
                } else if heap.cancelled_cause() == GCCause::EvacOom {
                    // Evacuation OOM skips the degenerated rung entirely.
                    let mut full = FullGC::new(heap);
                    full.collect();
                    heap.heuristics_mut().record_success_full();
                } else {
                    let mut degen = DegeneratedGC::new(heap, collector.degen_point());
                    if degen.collect() {
                        heap.heuristics_mut().record_success_degenerated();
                    } else {
                        let mut full = FullGC::new(heap);
                        full.collect();
                        heap.heuristics_mut().record_success_full();
                    }
                }
            }
            GCMode::STWDegen => {
                let mut degen = DegeneratedGC::new(heap, DegenPoint::OutsideCycle);
                if degen.collect() {
                    heap.heuristics_mut().record_success_degenerated();
                } else {
                    let mut full = FullGC::new(heap);
                    full.collect();
                    heap.heuristics_mut().record_success_full();
                }
            }
            GCMode::STWFull => {
                let mut full = FullGC::new(heap);
                full.collect();
                heap.heuristics_mut().record_success_full();
            }
            GCMode::None => {}
        }
    }

    fn service_uncommit(&self, shrink_before: Instant) {
        let heap = self.heap();
        let mut count = 0;

        for i in (0..heap.num_regions()).rev() {
            let r = heap.get_region(i);
            unsafe {
                heap.lock();
                if (*r).state() == super::region::RegionState::EmptyCommitted
                    && (*r).empty_time() < shrink_before
                    && !heap.free_set().is_collector_free(i)
                {
                    // Keep the region allocatable; it recommits on demand.
                    if (*r).make_empty_uncommitted().is_ok() {
                        heap.uncommit_region(r);
                        count += 1;
                    }
                }
                heap.unlock();
            }
        }

        if count > 0 {
            log::debug!(target: "gc", "Uncommitted {} regions", count);
            self.notify_heap_changed();
        }
    }

    pub fn should_terminate(&self) -> bool {
        self.should_terminate.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.should_terminate.store(true, Ordering::Release);
        let mut lock = self.terminator_lock.lock();
        while !self.has_terminated.load(Ordering::Relaxed) {
            self.terminator_cond.wait(&mut lock);
        }
    }
}
