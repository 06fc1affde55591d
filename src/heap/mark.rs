use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::object::{HeapObjectHeader, Slot, SlotVisitor};

use super::heap::Heap;
use super::marking_context::MarkingContext;

/// Scan granularity for reference arrays. Objects with more reference slots
/// than this are split into halves recursively, so one giant array never
/// starves the other workers.
const CHUNK_SLOTS: usize = 1024;

/// One unit of marking work: scan the reference slots `[from, to)` of an
/// already-marked object. Freshly marked objects enter as their full slot
/// range; oversized ranges split when popped.
#[derive(Clone, Copy)]
pub struct MarkTask {
    obj: usize,
    from: u32,
    to: u32,
}

impl MarkTask {
    pub fn scan(obj: *mut HeapObjectHeader, from: usize, to: usize) -> Self {
        Self {
            obj: obj as usize,
            from: from as u32,
            to: to as u32,
        }
    }

    pub fn obj(&self) -> *mut HeapObjectHeader {
        self.obj as *mut HeapObjectHeader
    }
}

/// Runtime shape of one marking pass. One branching loop body replaces a
/// family of compile-time specializations; the flags are read once per task,
/// which is lost in the noise next to the memory traffic of tracing.
#[derive(Clone, Copy)]
pub struct MarkConfig {
    /// Poll the heap cancellation flag and bail out when it fires.
    pub cancellable: bool,
    /// Pull completed SATB buffers into the queues before giving up.
    pub drain_satb: bool,
    /// Accumulate live bytes per region (needed by cset selection).
    pub count_liveness: bool,
    /// Resolve and rewrite stale references through the forwarding word
    /// while scanning; used when update-refs piggybacks on marking.
    pub update_refs: bool,
}

/// Work-stealing termination protocol: a worker that runs dry votes to stop;
/// if every worker is dry at once, marking is over, otherwise the vote is
/// retracted and stealing continues.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::Relaxed) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);

        loop {
            if nworkers == 0 {
                return true;
            }

            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    // Somebody still had work; resume stealing.
                    return false;
                }
                Err(prev) => nworkers = prev,
            }
        }
    }
}

const SEGMENT_SIZE: usize = 64;

/// Small private overflow buffer in front of the deque; cheap LIFO locality
/// for the hot path.
struct Segment {
    data: Vec<MarkTask>,
}

impl Segment {
    fn new() -> Segment {
        Segment {
            data: Vec::with_capacity(SEGMENT_SIZE),
        }
    }

    fn has_capacity(&self) -> bool {
        self.data.len() < SEGMENT_SIZE
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn push(&mut self, task: MarkTask) {
        debug_assert!(self.has_capacity());
        self.data.push(task);
    }

    fn pop(&mut self) -> Option<MarkTask> {
        self.data.pop()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// Per-worker deques plus the shared injector that roots and SATB drains
/// feed into.
pub struct MarkQueueSet {
    workers: Vec<Worker<MarkTask>>,
    stealers: Vec<Stealer<MarkTask>>,
    injector: Injector<MarkTask>,
}

impl MarkQueueSet {
    pub fn new(nworkers: usize) -> MarkQueueSet {
        let mut workers = Vec::with_capacity(nworkers);
        let mut stealers = Vec::with_capacity(nworkers);
        let injector = Injector::new();

        for _ in 0..nworkers {
            let w = Worker::new_lifo();
            let s = w.stealer();
            workers.push(w);
            stealers.push(s);
        }

        MarkQueueSet {
            workers,
            stealers,
            injector,
        }
    }

    pub fn worker(&self, id: usize) -> &Worker<MarkTask> {
        &self.workers[id]
    }

    pub fn stealers(&self) -> &[Stealer<MarkTask>] {
        &self.stealers
    }

    pub fn nworkers(&self) -> usize {
        self.workers.len()
    }

    pub fn injector(&self) -> &Injector<MarkTask> {
        &self.injector
    }

    /// Drops all queued work; used when a cycle is abandoned.
    pub fn abandon(&self) {
        for w in &self.workers {
            while w.pop().is_some() {}
        }
        loop {
            if let Steal::Empty = self.injector.steal() {
                break;
            }
        }
    }
}

/// One marking worker: drains its local segment and deque, then the shared
/// injector, then steals from siblings, until the termination protocol says
/// the closure is complete.
pub struct MarkingTask<'a> {
    task_id: usize,
    local: Segment,
    terminator: &'a Terminator,
    marked: usize,
    live: Vec<usize>,
    heap: &'static Heap,
    mark_ctx: &'static MarkingContext,
}

impl<'a> MarkingTask<'a> {
    pub fn new(
        task_id: usize,
        terminator: &'a Terminator,
        heap: &'static Heap,
        mark_ctx: &'static MarkingContext,
    ) -> MarkingTask<'a> {
        MarkingTask {
            task_id,
            local: Segment::new(),
            terminator,
            marked: 0,
            live: vec![0; heap.num_regions()],
            heap,
            mark_ctx,
        }
    }

    fn pop(&mut self) -> Option<MarkTask> {
        self.pop_local()
            .or_else(|| self.pop_worker())
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_local(&mut self) -> Option<MarkTask> {
        self.local.pop()
    }

    fn pop_worker(&mut self) -> Option<MarkTask> {
        self.mark_ctx.mark_queues().worker(self.task_id).pop()
    }

    fn worker(&self) -> &Worker<MarkTask> {
        self.mark_ctx.mark_queues().worker(self.task_id)
    }

    fn stealers(&self) -> &[Stealer<MarkTask>] {
        self.mark_ctx.mark_queues().stealers()
    }

    fn injector(&self) -> &Injector<MarkTask> {
        self.mark_ctx.mark_queues().injector()
    }

    fn pop_global(&mut self) -> Option<MarkTask> {
        loop {
            match self.injector().steal_batch_and_pop(self.worker()) {
                Steal::Empty => break,
                Steal::Success(value) => return Some(value),
                Steal::Retry => continue,
            }
        }
        None
    }

    fn steal(&self) -> Option<MarkTask> {
        if self.stealers().len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers().len());

        for _ in 0..2 * self.stealers().len() {
            let mut stealer_id = self.task_id;
            while stealer_id == self.task_id {
                stealer_id = range.sample(&mut rng);
            }

            let stealer = &self.stealers()[stealer_id];
            loop {
                match stealer.steal_batch_and_pop(self.worker()) {
                    Steal::Empty => break,
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Periodically spills half of a long local segment to the injector so
    /// idle workers have something to steal.
    fn defensive_push(&mut self) {
        self.marked += 1;

        if self.marked > 256 {
            if self.local.len() > 4 {
                let target_len = self.local.len() / 2;
                while self.local.len() > target_len {
                    let task = self.local.pop().unwrap();
                    self.injector().push(task);
                }
            }
            self.marked = 0;
        }
    }

    pub fn run(&mut self, config: MarkConfig) {
        loop {
            let task = if let Some(task) = self.pop() {
                task
            } else if config.drain_satb && self.drain_satb() {
                continue;
            } else if config.cancellable && self.heap.cancelled_gc() {
                break;
            } else if self.terminator.try_terminate() {
                break;
            } else {
                continue;
            };

            self.do_task(task, config);
        }

        if config.count_liveness {
            self.flush_liveness();
        }
    }

    /// Pulls completed SATB buffers into this worker's queue. Returns true
    /// if anything was drained.
    fn drain_satb(&mut self) -> bool {
        let mut drained = false;
        let satb = self.heap.satb_queue_set();
        satb.drain(|obj| {
            if obj.is_null() {
                return;
            }
            // Snapshot entries may predate evacuation; mark the current copy.
            let obj = unsafe { (*obj).forwardee() };
            if self.mark_ctx.mark(obj) {
                unsafe {
                    self.account_live(obj);
                    if (*obj).ref_len() > 0 {
                        self.worker()
                            .push(MarkTask::scan(obj, 0, (*obj).ref_len()));
                    }
                }
                drained = true;
            }
        });
        drained
    }

    fn do_task(&mut self, task: MarkTask, config: MarkConfig) {
        let obj = task.obj();
        let from = task.from as usize;
        let to = task.to as usize;

        // Chunk outsized reference arrays; halve until digestible.
        if to - from > CHUNK_SLOTS {
            let mid = from + (to - from) / 2;
            self.push(MarkTask::scan(obj, from, mid));
            self.push(MarkTask::scan(obj, mid, to));
            return;
        }

        unsafe {
            for i in from..to {
                let slot = (*obj).slot(i);
                let mut child = slot.load();
                if child.is_null() {
                    continue;
                }
                if config.update_refs {
                    let fwd = (*child).forwardee();
                    if fwd != child {
                        slot.store(fwd);
                        child = fwd;
                    }
                }
                self.try_mark(child, config);
            }
        }
    }

    pub fn try_mark(&mut self, obj: *mut HeapObjectHeader, config: MarkConfig) {
        debug_assert!(self.heap.is_in(obj as usize));
        if self.mark_ctx.mark(obj) {
            if config.count_liveness {
                unsafe {
                    self.live[self.heap.region_index(obj as usize)] += (*obj).size();
                }
            }
            unsafe {
                if (*obj).ref_len() > 0 {
                    self.push(MarkTask::scan(obj, 0, (*obj).ref_len()));
                }
            }
        }
    }

    unsafe fn account_live(&mut self, obj: *mut HeapObjectHeader) {
        self.live[self.heap.region_index(obj as usize)] += (*obj).size();
    }

    fn push(&mut self, task: MarkTask) {
        if self.local.has_capacity() {
            self.local.push(task);
            self.defensive_push();
        } else {
            self.worker().push(task);
        }
    }

    /// Publishes this worker's liveness buffer into the shared per-region
    /// counters. Batched here to keep atomic traffic out of the mark loop.
    fn flush_liveness(&mut self) {
        for (index, bytes) in self.live.iter_mut().enumerate() {
            if *bytes > 0 {
                unsafe {
                    (*self.heap.get_region(index)).increase_live_data(*bytes);
                }
                *bytes = 0;
            }
        }
    }
}

/// Root visitor feeding the marking queues. Marks the root object inline
/// (accounting its liveness) and schedules its slots for scanning; with
/// `update_refs` it also heals stale root references through the forwarding
/// word.
pub struct MarkRootVisitor<'a> {
    heap: &'a Heap,
    mark_ctx: &'a MarkingContext,
    update_refs: bool,
}

impl<'a> MarkRootVisitor<'a> {
    pub fn new(heap: &'a Heap, mark_ctx: &'a MarkingContext, update_refs: bool) -> Self {
        Self {
            heap,
            mark_ctx,
            update_refs,
        }
    }
}

impl<'a> SlotVisitor for MarkRootVisitor<'a> {
    fn visit(&mut self, slot: Slot) {
        let mut obj = slot.load();
        if obj.is_null() {
            return;
        }
        unsafe {
            if self.update_refs {
                let fwd = (*obj).forwardee();
                if fwd != obj {
                    slot.store(fwd);
                    obj = fwd;
                }
            }
            if self.mark_ctx.mark(obj) {
                let region = self.heap.get_region(self.heap.region_index(obj as usize));
                (*region).increase_live_data((*obj).size());
                if (*obj).ref_len() > 0 {
                    self.mark_ctx
                        .mark_queues()
                        .injector()
                        .push(MarkTask::scan(obj, 0, (*obj).ref_len()));
                }
            }
        }
    }
}

/// Runs marking to completion across the worker pool.
pub fn run_marking(heap: &'static Heap, config: MarkConfig) {
    let mc = heap.marking_context();
    let nworkers = mc.mark_queues().nworkers();
    let terminator = Terminator::new(nworkers);

    heap.workers().scoped(|scope| {
        for task_id in 0..nworkers {
            let terminator = &terminator;
            scope.execute(move || {
                let mut task = MarkingTask::new(task_id, terminator, heap, heap.marking_context());
                task.run(config);
            });
        }
    });
}
