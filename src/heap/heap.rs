use std::sync::atomic::{AtomicUsize, Ordering};

use atomic::Atomic;
use parking_lot::{lock_api::RawMutex as RawMutexApi, Mutex, RawMutex};
use scoped_thread_pool::Pool;

use crate::object::{HeapObjectHeader, SlotVisitor};
use crate::utils::formatted_size;

use super::collection_set::CollectionSet;
use super::controller::ControlThread;
use super::free_set::RegionFreeSet;
use super::heuristics::{new_heuristics, Heuristics};
use super::marking_context::MarkingContext;
use super::region::{HeapArguments, HeapOptions, HeapRegion};
use super::safepoint::Safepoint;
use super::satb_mark_queue::SatbMarkQueueSet;
use super::shared_vars::SharedFlag;
use super::thread::{MutatorThread, SafeScope, Threads};
use super::virtual_memory::VirtualMemory;
use super::{AllocRequest, AllocType, GCCause};

/// Supplies the collector with the roots of the object graph: thread stacks,
/// globals, handle tables, or whatever else the embedder holds references in.
/// Must
/// visit every root slot exactly once per requested scan; `worker_id` /
/// `nworkers` let providers partition themselves for parallel scanning.
pub trait RootProvider: Send + Sync {
    fn scan_roots(&self, visitor: &mut dyn SlotVisitor, worker_id: usize, nworkers: usize);
}

/// The heap: region table, free set, marking state, collection set, worker
/// pool and every cross-cutting flag of the collector. Constructed once and
/// leaked; every component holds a non-owning back-reference. There is
/// deliberately no process-wide singleton, so tests build several heaps side
/// by side.
pub struct Heap {
    lock: RawMutex,
    mem: VirtualMemory,
    opts: Box<HeapOptions>,
    regions: Vec<*mut HeapRegion>,
    free_set: RegionFreeSet,
    collection_set: CollectionSet,
    marking_context: Box<MarkingContext>,
    heuristics: Box<dyn Heuristics>,
    satb_queue_set: SatbMarkQueueSet,
    threads: Threads,
    safepoint: Safepoint,
    workers: Pool,
    controller: Option<&'static ControlThread>,
    roots: Mutex<Vec<Box<dyn RootProvider>>>,
    weak_roots: Mutex<Vec<usize>>,

    used: AtomicUsize,
    committed: AtomicUsize,
    bytes_allocated_since_gc_start: AtomicUsize,
    gc_id: AtomicUsize,
    update_refs_cursor: AtomicUsize,

    is_concurrent_mark_in_progress: SharedFlag,
    is_evacuation_in_progress: SharedFlag,
    is_update_refs_in_progress: SharedFlag,
    is_full_gc_in_progress: SharedFlag,
    has_forwarded: SharedFlag,
    progress_last_gc: SharedFlag,
    cancelled_gc: Atomic<GCCause>,
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

impl Heap {
    pub fn new(args: HeapArguments) -> &'static mut Self {
        let opts = HeapRegion::setup_sizes(&args);

        let mem = VirtualMemory::reserve(opts.max_heap_size, opts.region_size_bytes)
            .expect("failed to reserve heap address space");
        // Commit everything up front; the uncommit service trims idle
        // regions later when enabled.
        mem.commit(mem.start(), mem.size());

        let nworkers = opts.parallel_gc_threads.max(opts.concurrent_gc_threads);
        let marking_context = Box::new(MarkingContext::new(mem.start(), mem.size(), nworkers));

        let mut regions = Vec::with_capacity(opts.region_count);
        for i in 0..opts.region_count {
            let bottom = mem.start() + i * opts.region_size_bytes;
            regions.push(Box::into_raw(Box::new(HeapRegion::new(
                i, bottom, &opts, true,
            ))));
        }

        let free_set = RegionFreeSet::new(&opts);
        let collection_set = CollectionSet::new(opts.region_count);
        let heuristics = new_heuristics(&opts);
        let committed = mem.size();

        let this = Box::leak(Box::new(Self {
            lock: RawMutex::INIT,
            mem,
            regions,
            free_set,
            collection_set,
            marking_context,
            heuristics,
            satb_queue_set: SatbMarkQueueSet::new(1024),
            threads: Threads::new(),
            safepoint: Safepoint::new(),
            workers: Pool::new(nworkers),
            controller: None,
            roots: Mutex::new(Vec::new()),
            weak_roots: Mutex::new(Vec::new()),
            used: AtomicUsize::new(0),
            committed: AtomicUsize::new(committed),
            bytes_allocated_since_gc_start: AtomicUsize::new(0),
            gc_id: AtomicUsize::new(0),
            update_refs_cursor: AtomicUsize::new(0),
            is_concurrent_mark_in_progress: SharedFlag::new(),
            is_evacuation_in_progress: SharedFlag::new(),
            is_update_refs_in_progress: SharedFlag::new(),
            is_full_gc_in_progress: SharedFlag::new(),
            has_forwarded: SharedFlag::new(),
            progress_last_gc: SharedFlag::new(),
            cancelled_gc: Atomic::new(GCCause::None),
            opts: Box::new(opts),
        }));

        let ptr = this as *mut Heap;
        this.free_set.set_heap(ptr);
        this.heuristics.set_heap(ptr);
        this.lock();
        this.free_set.rebuild();
        this.unlock();

        if args.start_control_thread {
            this.controller = Some(ControlThread::new(ptr));
        }

        log::info!(target: "gc", "Initialized heap: {}", this.opts);
        this
    }

    #[allow(clippy::mut_from_ref)]
    #[allow(invalid_reference_casting)]
    fn as_mut(&self) -> &mut Heap {
        unsafe { &mut *(self as *const Heap as *mut Heap) }
    }

    pub(crate) fn lock(&self) {
        self.lock.lock();
    }

    pub(crate) fn unlock(&self) {
        unsafe { self.lock.unlock() }
    }

    pub fn options(&self) -> &HeapOptions {
        &self.opts
    }

    pub fn num_regions(&self) -> usize {
        self.opts.region_count
    }

    pub fn get_region(&self, index: usize) -> *mut HeapRegion {
        self.regions[index]
    }

    pub fn region_index(&self, addr: usize) -> usize {
        debug_assert!(self.is_in(addr));
        (addr - self.mem.start()) >> self.opts.region_size_bytes_shift
    }

    pub fn is_in(&self, addr: usize) -> bool {
        self.mem.contains(addr)
    }

    pub fn mem_start(&self) -> usize {
        self.mem.start()
    }

    pub fn max_capacity(&self) -> usize {
        self.regions.len() * self.opts.region_size_bytes
    }

    pub fn free_set(&self) -> &RegionFreeSet {
        &self.free_set
    }

    #[allow(clippy::mut_from_ref)]
    pub fn free_set_mut(&self) -> &mut RegionFreeSet {
        &mut self.as_mut().free_set
    }

    pub fn collection_set(&self) -> &CollectionSet {
        &self.collection_set
    }

    #[allow(clippy::mut_from_ref)]
    pub fn collection_set_mut(&self) -> &mut CollectionSet {
        &mut self.as_mut().collection_set
    }

    pub fn in_collection_set(&self, addr: usize) -> bool {
        self.is_in(addr) && self.collection_set.is_in(self.region_index(addr))
    }

    pub fn marking_context(&self) -> &MarkingContext {
        &self.marking_context
    }

    pub fn heuristics(&self) -> &dyn Heuristics {
        &*self.heuristics
    }

    #[allow(clippy::mut_from_ref)]
    pub fn heuristics_mut(&self) -> &mut dyn Heuristics {
        &mut *self.as_mut().heuristics
    }

    pub fn satb_queue_set(&self) -> &SatbMarkQueueSet {
        &self.satb_queue_set
    }

    pub fn threads(&self) -> &Threads {
        &self.threads
    }

    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    pub fn workers(&self) -> &Pool {
        &self.workers
    }

    pub fn controller_thread(&self) -> Option<&'static ControlThread> {
        self.controller
    }

    pub fn gc_id(&self) -> usize {
        self.gc_id.load(Ordering::Relaxed)
    }

    pub(crate) fn update_gc_id(&self) {
        self.gc_id.fetch_add(1, Ordering::Relaxed);
    }

    // ---- mutator attachment ------------------------------------------------

    pub fn attach_mutator(&self) -> &'static MutatorThread {
        self.threads
            .attach(self as *const Heap as *mut Heap)
    }

    pub fn detach_mutator(&self, thread: &'static MutatorThread) {
        self.threads.detach(thread);
    }

    // ---- roots -------------------------------------------------------------

    pub fn add_root_provider(&self, provider: Box<dyn RootProvider>) {
        self.roots.lock().push(provider);
    }

    /// Registers a weak reference slot: it never keeps its referent alive and
    /// is nulled once the referent dies.
    pub fn add_weak_ref(&self, slot: *mut *mut HeapObjectHeader) {
        self.weak_roots.lock().push(slot as usize);
    }

    pub fn scan_roots(&self, visitor: &mut dyn SlotVisitor, worker_id: usize, nworkers: usize) {
        let roots = self.roots.lock();
        for provider in roots.iter() {
            provider.scan_roots(visitor, worker_id, nworkers);
        }
    }

    pub(crate) fn scan_weak_roots(&self, visitor: &mut dyn SlotVisitor) {
        let weak = self.weak_roots.lock();
        for &slot in weak.iter() {
            visitor.visit(crate::object::Slot(slot as *mut *mut HeapObjectHeader));
        }
    }

    /// Clears weak slots whose referents did not survive marking; with
    /// `drop_cleared` the registry also forgets the dead entries.
    pub(crate) fn process_weak_refs(&self, drop_cleared: bool) {
        let mut weak = self.weak_roots.lock();
        for &slot in weak.iter() {
            unsafe {
                let slot = slot as *mut *mut HeapObjectHeader;
                let obj = slot.read();
                if !obj.is_null() && !self.marking_context.is_marked_next(obj) {
                    slot.write(std::ptr::null_mut());
                }
            }
        }
        if drop_cleared {
            weak.retain(|&slot| unsafe { !(slot as *mut *mut HeapObjectHeader).read().is_null() });
        }
    }

    // ---- accounting --------------------------------------------------------

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn increase_used(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn decrease_used(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::Relaxed);
    }

    pub fn set_used(&self, bytes: usize) {
        self.used.store(bytes, Ordering::Relaxed);
    }

    pub fn committed(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn bytes_allocated_since_gc_start(&self) -> usize {
        self.bytes_allocated_since_gc_start.load(Ordering::Relaxed)
    }

    pub fn set_allocated(&self, bytes: usize) {
        self.bytes_allocated_since_gc_start
            .store(bytes, Ordering::Relaxed);
    }

    pub fn notify_mutator_alloc(&self, bytes: usize, waste: bool) {
        let _ = waste;
        self.bytes_allocated_since_gc_start
            .fetch_add(bytes, Ordering::Relaxed);
    }

    // ---- gc state flags ----------------------------------------------------

    pub fn is_concurrent_mark_in_progress(&self) -> bool {
        self.is_concurrent_mark_in_progress.is_set()
    }

    pub fn set_concurrent_mark_in_progress(&self, value: bool) {
        self.is_concurrent_mark_in_progress.set_cond(value);
        self.satb_queue_set.set_active(value);
        // Propagate into per-thread SATB buffers; callers flip this inside a
        // safepoint, so the threads are stable.
        for thread in self.threads.get() {
            unsafe {
                (*thread).satb_queue().set_active(value);
            }
        }
    }

    pub fn is_evacuation_in_progress(&self) -> bool {
        self.is_evacuation_in_progress.is_set()
    }

    pub fn set_evacuation_in_progress(&self, value: bool) {
        self.is_evacuation_in_progress.set_cond(value);
    }

    pub fn is_update_refs_in_progress(&self) -> bool {
        self.is_update_refs_in_progress.is_set()
    }

    pub fn set_update_refs_in_progress(&self, value: bool) {
        self.is_update_refs_in_progress.set_cond(value);
    }

    pub fn is_full_gc_in_progress(&self) -> bool {
        self.is_full_gc_in_progress.is_set()
    }

    pub fn set_full_gc_in_progress(&self, value: bool) {
        self.is_full_gc_in_progress.set_cond(value);
    }

    pub fn has_forwarded_objects(&self) -> bool {
        self.has_forwarded.is_set()
    }

    pub fn set_has_forwarded_objects(&self, value: bool) {
        self.has_forwarded.set_cond(value);
    }

    pub fn notify_gc_progress(&self) {
        self.progress_last_gc.set();
    }

    pub fn notify_no_gc_progress(&self) {
        self.progress_last_gc.unset();
    }

    pub fn progress_last_gc(&self) -> bool {
        self.progress_last_gc.is_set()
    }

    // ---- cancellation ------------------------------------------------------

    /// Requests cancellation of the in-flight concurrent cycle. The first
    /// cause wins, except that `EvacOom` upgrades a plain allocation
    /// failure: a half-evacuated cset demands the stronger response.
    pub fn cancel_gc(&self, cause: GCCause) {
        debug_assert!(cause != GCCause::None);
        loop {
            let current = self.cancelled_gc.load(Ordering::Acquire);
            let should_store = match current {
                GCCause::None => true,
                GCCause::AllocFailure | GCCause::Requested => cause == GCCause::EvacOom,
                _ => false,
            };
            if !should_store {
                return;
            }
            if self
                .cancelled_gc
                .compare_exchange(current, cause, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                log::debug!(target: "gc", "Cancelling GC: {:?}", cause);
                return;
            }
        }
    }

    pub fn cancelled_gc(&self) -> bool {
        self.cancelled_gc.load(Ordering::Acquire) != GCCause::None
    }

    pub fn cancelled_cause(&self) -> GCCause {
        self.cancelled_gc.load(Ordering::Acquire)
    }

    pub fn clear_cancelled_gc(&self) {
        self.cancelled_gc.store(GCCause::None, Ordering::Release);
    }

    // ---- allocation --------------------------------------------------------

    pub(crate) fn commit_region(&self, region: *mut HeapRegion) {
        unsafe {
            self.mem.commit((*region).bottom(), (*region).size());
            (*region)
                .make_empty_committed()
                .expect("only uncommitted regions are committed");
            self.committed.fetch_add((*region).size(), Ordering::Relaxed);
        }
    }

    pub(crate) fn uncommit_region(&self, region: *mut HeapRegion) {
        unsafe {
            debug_assert!(!(*region).is_committed());
            self.mem.uncommit((*region).bottom(), (*region).size());
            self.committed.fetch_sub((*region).size(), Ordering::Relaxed);
        }
    }

    fn allocate_memory_under_lock(
        &self,
        req: &mut AllocRequest,
        in_new_region: &mut bool,
    ) -> *mut u8 {
        self.lock();
        let mem = self.free_set_mut().allocate(req, in_new_region);
        self.unlock();
        mem
    }

    /// Mutator-side allocation. On failure the allocation-failure protocol
    /// runs bounded GC-and-retry rounds before giving up and returning null,
    /// which the embedder surfaces as its out-of-memory condition.
    pub fn allocate_memory(
        &self,
        req: &mut AllocRequest,
        thread: Option<&MutatorThread>,
    ) -> *mut u8 {
        debug_assert!(req.alloc_type().is_mutator_alloc());
        if req.size() > self.max_capacity() {
            return std::ptr::null_mut();
        }

        let mut in_new_region = false;
        let mut result = self.allocate_memory_under_lock(req, &mut in_new_region);

        if let Some(controller) = self.controller {
            // It can happen that a thread unblocks after a GC only to find
            // the storage already depleted again; keep retrying as long as
            // collections make progress, then a few more times to ride over
            // at least one full collection.
            let mut tries = 0;
            while result.is_null() && self.progress_last_gc.is_set() {
                tries += 1;
                self.handle_alloc_failure(controller, req, thread);
                result = self.allocate_memory_under_lock(req, &mut in_new_region);
            }
            while result.is_null() && tries <= 3 {
                tries += 1;
                self.handle_alloc_failure(controller, req, thread);
                result = self.allocate_memory_under_lock(req, &mut in_new_region);
            }
        }

        if in_new_region {
            if let Some(controller) = self.controller {
                controller.notify_heap_changed();
            }
        }

        if !result.is_null() {
            debug_assert!(
                req.alloc_type().is_lab_alloc() || req.size() == req.actual_size(),
                "only LAB allocations are elastic: requested {}, actual {}",
                formatted_size(req.size()),
                formatted_size(req.actual_size())
            );
            self.notify_mutator_alloc(req.actual_size(), false);
        }
        result
    }

    fn handle_alloc_failure(
        &self,
        controller: &ControlThread,
        req: &AllocRequest,
        thread: Option<&MutatorThread>,
    ) {
        // Blocking on the controller is a safepoint-safe wait.
        match thread {
            Some(t) => {
                let scope = SafeScope::new(t);
                controller.handle_alloc_failure_gc(self, req);
                drop(scope);
            }
            None => controller.handle_alloc_failure_gc(self, req),
        }
    }

    /// Collector-side allocation (GCLAB refills and oversized evacuation
    /// copies). No retry loop: failure here means the cycle dies.
    pub fn allocate_memory_for_gc(&self, req: &mut AllocRequest) -> *mut u8 {
        debug_assert!(req.alloc_type().is_gc_alloc());
        let mut in_new_region = false;
        let result = self.allocate_memory_under_lock(req, &mut in_new_region);
        result
    }

    /// Allocates and initializes one object with `payload_words` words of
    /// payload, the first `ref_len` of which are reference slots. Returns
    /// null on out-of-memory.
    pub fn allocate_object(
        &self,
        thread: Option<&MutatorThread>,
        payload_words: usize,
        ref_len: usize,
    ) -> *mut HeapObjectHeader {
        debug_assert!(ref_len <= payload_words);
        let size = HeapObjectHeader::required_size(payload_words);

        let raw = if let Some(t) = thread {
            if size <= self.opts.max_tlab_size {
                self.allocate_from_tlab(t, size)
            } else {
                let mut req = AllocRequest::new(AllocType::Shared, size, size);
                self.allocate_memory(&mut req, thread)
            }
        } else {
            let mut req = AllocRequest::new(AllocType::Shared, size, size);
            self.allocate_memory(&mut req, thread)
        };

        if raw.is_null() {
            return std::ptr::null_mut();
        }

        let obj = unsafe { HeapObjectHeader::initialize(raw, size, ref_len) };

        // Objects born during marking are allocated live: the cycle's
        // snapshot predates them, so they cannot be proven reachable by it.
        if self.is_concurrent_mark_in_progress() {
            self.marking_context.mark(obj);
            unsafe {
                (*self.get_region(self.region_index(obj as usize))).increase_live_data(size);
            }
        }

        obj
    }

    fn allocate_from_tlab(&self, thread: &MutatorThread, size: usize) -> *mut u8 {
        let tlab = unsafe { thread.tlab() };
        let addr = tlab.allocate(size);
        if !addr.is_null() {
            self.notify_mutator_alloc(size, false);
            return addr;
        }

        // Refill: carve a fresh TLAB, then serve from it.
        let desired = self.max_tlab_alloc().max(size);
        let mut req = AllocRequest::new(AllocType::Tlab, size.max(self.opts.min_tlab_size), desired);
        let mem = self.allocate_memory(&mut req, Some(thread));
        if mem.is_null() {
            return std::ptr::null_mut();
        }
        tlab.initialize(mem as usize, mem as usize + req.actual_size());
        let addr = tlab.allocate(size);
        debug_assert!(!addr.is_null());
        addr
    }

    /// Retires every registered mutator's TLAB; called inside pauses.
    pub(crate) fn retire_tlabs(&self) {
        for thread in self.threads.get() {
            unsafe {
                (*thread).retire_tlab();
            }
        }
    }

    pub(crate) fn flush_satb_buffers(&self) {
        for thread in self.threads.get() {
            unsafe {
                (*thread).flush_satb();
            }
        }
    }

    pub(crate) fn max_tlab_alloc(&self) -> usize {
        if self.opts.elastic_tlab {
            self.opts.max_tlab_size
        } else {
            unsafe { self.free_set.unsafe_peek_free().min(self.opts.max_tlab_size) }
        }
    }

    // ---- region service ----------------------------------------------------

    pub fn rebuild_free_set(&self) {
        self.lock();
        self.free_set_mut().rebuild();
        self.unlock();
    }

    pub fn recycle_trash(&self) {
        self.free_set_mut().recycle_trash();
    }

    /// Trashes the whole run of regions backing one dead humongous object.
    /// Returns the number of regions reclaimed.
    pub fn trash_humongous_region_at(&self, start: *mut HeapRegion) -> usize {
        unsafe {
            debug_assert!((*start).is_humongous_start());
            let obj = (*start).bottom() as *mut HeapObjectHeader;
            let required = self.opts.required_regions((*obj).size());

            let mut index = (*start).index() + required - 1;
            for _ in 0..required {
                let region = self.get_region(index);
                debug_assert!((*region).is_humongous());
                (*region)
                    .make_trash()
                    .expect("humongous regions can always be trashed");
                index = index.wrapping_sub(1);
            }
            required
        }
    }

    /// Resets marking inputs for a new cycle: clean next bitmap, zeroed
    /// per-region liveness.
    pub fn prepare_gc(&self) {
        self.marking_context.clear_next_bitmap();
        self.marking_context.mark_incomplete();
        for i in 0..self.num_regions() {
            unsafe {
                (*self.get_region(i)).clear_live_data();
            }
        }
    }

    // ---- update-refs claim protocol ---------------------------------------

    pub(crate) fn reset_update_refs_cursor(&self) {
        self.update_refs_cursor.store(0, Ordering::Release);
    }

    pub(crate) fn claim_update_refs_region(&self) -> Option<usize> {
        let at = self.update_refs_cursor.fetch_add(1, Ordering::AcqRel);
        if at < self.num_regions() {
            Some(at)
        } else {
            None
        }
    }

    // ---- triggers ----------------------------------------------------------

    pub fn should_start_gc(&self) -> bool {
        let used = self.used();
        let capacity = self.max_capacity();
        self.heuristics_mut().should_start_concurrent_mark(used, capacity)
    }

    pub fn should_degenerate_cycle(&self) -> bool {
        self.opts.degenerated_gc_enabled
            && self
                .heuristics()
                .should_degenerate_cycle(self.opts.full_gc_threshold)
    }

    /// Blocks until the control thread has run one full collection on the
    /// caller's behalf.
    pub fn request_gc(&self) {
        let controller = self
            .controller
            .expect("explicit GC requests need the control thread");
        self.heuristics_mut().record_requested_gc();
        controller.handle_requested_gc(self);
    }

    pub fn print_on<W: std::fmt::Write>(&self, st: &mut W) -> std::fmt::Result {
        write!(
            st,
            "Heap {} max, {} committed, {} used, {} x {} regions",
            formatted_size(self.max_capacity()),
            formatted_size(self.committed()),
            formatted_size(self.used()),
            self.num_regions(),
            formatted_size(self.opts.region_size_bytes)
        )
    }

    /// Terminates the control thread and tears the heap down. The caller
    /// must have detached every mutator first.
    pub fn stop(&mut self) {
        if let Some(controller) = self.controller.take() {
            controller.stop();
        }
        log::debug!(target: "gc", "Heap stopped");
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.stop();
        for region in self.regions.drain(..) {
            unsafe {
                drop(Box::from_raw(region));
            }
        }
    }
}
