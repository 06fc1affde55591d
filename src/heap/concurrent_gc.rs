use std::time::Instant;

use super::evacuation::{evacuate_and_update_roots, evacuate_collection_set};
use super::heap::Heap;
use super::mark::{run_marking, MarkConfig, MarkRootVisitor};
use super::safepoint::SafepointSynchronize;
use super::update_refs::{update_heap_references, update_roots, UpdateRefsVisitor};
use super::{ConcurrentPhase, DegenPoint, GCCause, PausePhase};

/// One concurrent collection cycle. Every phase boundary is a cancellation
/// checkpoint: when the cycle is cancelled, the checkpoint records which
/// phase was interrupted and unwinds, and the degenerated continuation
/// re-enters at exactly that phase.
pub struct ConcurrentGC {
    heap: &'static Heap,
    degen_point: DegenPoint,
    process_references: bool,
    unload_classes: bool,
    coalesce_update_refs: bool,
    /// The previous cycle coalesced its update-refs into this cycle's mark.
    carry_forwarded: bool,
}

impl ConcurrentGC {
    pub fn new(heap: &'static Heap) -> Self {
        // Latched once; the cycle never re-consults the policy mid-flight.
        let process_references = heap.heuristics().should_process_references();
        let unload_classes = heap.heuristics().should_unload_classes();
        let coalesce_update_refs = heap.heuristics().should_coalesce_update_refs();
        Self {
            heap,
            degen_point: DegenPoint::Unset,
            process_references,
            unload_classes,
            coalesce_update_refs,
            carry_forwarded: false,
        }
    }

    pub fn degen_point(&self) -> DegenPoint {
        self.degen_point
    }

    fn check_cancellation_and_abort(&mut self, point: DegenPoint) -> bool {
        if self.heap.cancelled_gc() {
            self.degen_point = point;
            return true;
        }
        false
    }

    pub fn collect(&mut self) -> bool {
        let heap = self.heap;
        let start = Instant::now();

        self.entry_init_mark();

        {
            let _phase = ConcurrentPhase::new(heap.gc_id(), "marking");
            run_marking(
                heap,
                MarkConfig {
                    cancellable: true,
                    drain_satb: true,
                    count_liveness: true,
                    update_refs: self.carry_forwarded,
                },
            );
        }
        if self.check_cancellation_and_abort(DegenPoint::ConcurrentMark) {
            return false;
        }

        self.entry_preclean();
        if self.check_cancellation_and_abort(DegenPoint::ConcurrentMark) {
            return false;
        }

        let has_work = self.entry_final_mark();
        if heap.cancelled_cause() == GCCause::EvacOom {
            // Root evacuation already failed its allocation; only the full
            // collection untangles a partially evacuated heap.
            self.degen_point = DegenPoint::ConcurrentEvac;
            return false;
        }

        {
            let _phase = ConcurrentPhase::new(heap.gc_id(), "cleanup");
            heap.recycle_trash();
        }

        if !has_work {
            // Immediate-garbage shortcut: nothing to evacuate, the cycle is
            // done after reclaiming fully dead regions.
            self.entry_cycle_end(start);
            return true;
        }

        {
            let _phase = ConcurrentPhase::new(heap.gc_id(), "evacuation");
            evacuate_collection_set(heap);
        }
        if self.check_cancellation_and_abort(DegenPoint::ConcurrentEvac) {
            return false;
        }
        heap.set_evacuation_in_progress(false);

        if self.coalesce_update_refs {
            // Shortcut: leave the forwarded objects in place; the next
            // cycle's marking rewrites stale references as it scans and
            // reclaims the collection set at its final mark.
            log::debug!(target: "gc", "Coalescing update-refs into next cycle's mark");
        } else {
            self.entry_init_updaterefs();
            {
                let _phase = ConcurrentPhase::new(heap.gc_id(), "update references");
                update_heap_references(heap, true);
            }
            if self.check_cancellation_and_abort(DegenPoint::ConcurrentUpdateRefs) {
                return false;
            }
            self.entry_final_updaterefs();
        }

        self.entry_cycle_end(start);
        true
    }

    pub(crate) fn entry_init_mark(&mut self) {
        let heap = self.heap;
        SafepointSynchronize::begin(heap);
        let phase = PausePhase::new(heap.gc_id(), "Init Mark");

        assert!(!heap.is_concurrent_mark_in_progress());
        heap.prepare_gc();
        heap.retire_tlabs();

        self.carry_forwarded = heap.has_forwarded_objects();
        heap.set_concurrent_mark_in_progress(true);

        // Root snapshot. With a coalesced update-refs carried over from the
        // previous cycle, stale roots are healed right here.
        let mut visitor = MarkRootVisitor::new(heap, heap.marking_context(), self.carry_forwarded);
        heap.scan_roots(&mut visitor, 0, 1);

        drop(phase);
        SafepointSynchronize::end(heap);
    }

    /// Optional concurrent drain of accumulated SATB buffers; shortens the
    /// final-mark pause.
    fn entry_preclean(&mut self) {
        let heap = self.heap;
        let _phase = ConcurrentPhase::new(heap.gc_id(), "preclean");
        run_marking(
            heap,
            MarkConfig {
                cancellable: true,
                drain_satb: true,
                count_liveness: true,
                update_refs: self.carry_forwarded,
            },
        );
    }

    /// The final-mark pause: complete the closure, process weak references,
    /// publish the bitmap, select the collection set and evacuate roots.
    /// Returns whether there is anything to evacuate.
    pub(crate) fn entry_final_mark(&mut self) -> bool {
        let heap = self.heap;
        SafepointSynchronize::begin(heap);
        let phase = PausePhase::new(heap.gc_id(), "Final Mark");

        heap.retire_tlabs();
        finish_mark(
            heap,
            self.carry_forwarded,
            self.process_references,
            self.unload_classes,
        );
        let has_work = prepare_evacuation(heap);

        drop(phase);
        SafepointSynchronize::end(heap);
        has_work
    }

    fn entry_init_updaterefs(&mut self) {
        let heap = self.heap;
        SafepointSynchronize::begin(heap);
        let phase = PausePhase::new(heap.gc_id(), "Init Update Refs");

        heap.retire_tlabs();
        heap.set_update_refs_in_progress(true);
        heap.reset_update_refs_cursor();

        drop(phase);
        SafepointSynchronize::end(heap);
    }

    fn entry_final_updaterefs(&mut self) {
        let heap = self.heap;
        SafepointSynchronize::begin(heap);
        let phase = PausePhase::new(heap.gc_id(), "Final Update Refs");

        finish_update_refs(heap);

        drop(phase);
        SafepointSynchronize::end(heap);
    }

    fn entry_cycle_end(&mut self, start: Instant) {
        let heap = self.heap;
        heap.recycle_trash();
        heap.notify_gc_progress();
        log::debug!(
            target: "gc",
            "Concurrent GC end in {:.3} ms",
            start.elapsed().as_micros() as f64 / 1000.0
        );
    }
}

/// Completes marking inside a pause: flushed SATB buffers, re-scanned roots
/// (they mutate between init and final mark), drained queues, weak-reference
/// processing, and the bitmap swap that publishes the result. Shared between
/// the concurrent cycle and the degenerated continuation.
pub(crate) fn finish_mark(
    heap: &'static Heap,
    carry_forwarded: bool,
    process_references: bool,
    unload_classes: bool,
) {
    heap.flush_satb_buffers();

    let mut visitor = MarkRootVisitor::new(heap, heap.marking_context(), carry_forwarded);
    heap.scan_roots(&mut visitor, 0, 1);

    run_marking(
        heap,
        MarkConfig {
            cancellable: false,
            drain_satb: true,
            count_liveness: true,
            update_refs: carry_forwarded,
        },
    );

    heap.set_concurrent_mark_in_progress(false);

    if process_references {
        heap.process_weak_refs(unload_classes);
    }

    // A coalesced cycle pair reclaims the previous collection set here: by
    // now marking has healed every reference into it.
    if carry_forwarded {
        let cset = heap.collection_set_mut();
        for &index in cset.regions() {
            unsafe {
                (*heap.get_region(index))
                    .make_trash()
                    .expect("healed cset region must become trash");
            }
        }
        cset.clear();
        heap.set_has_forwarded_objects(false);
    }

    heap.marking_context().mark_complete();
    heap.marking_context().swap_bitmaps();
}

/// Selects the collection set, repartitions the free set and evacuates the
/// roots, all inside the final-mark pause. The world is stopped, so region
/// state flips here need no heap lock. Returns false when the collection set
/// came out empty.
pub(crate) fn prepare_evacuation(heap: &'static Heap) -> bool {
    let cset = heap.collection_set_mut();
    cset.clear();

    heap.heuristics_mut().choose_collection_set(heap, cset);
    heap.heuristics().choose_free_set(heap);

    if cset.is_empty() {
        return false;
    }

    heap.set_has_forwarded_objects(true);
    heap.set_evacuation_in_progress(true);

    // Roots must refer to to-space before any mutator resumes.
    evacuate_and_update_roots(heap);
    true
}

/// The final-update-refs pause body: heal the roots, drop the forwarding
/// window, recycle the collection set and rebuild the free set. Shared with
/// the degenerated continuation.
pub(crate) fn finish_update_refs(heap: &'static Heap) {
    update_roots(heap);
    let mut weak_visitor = UpdateRefsVisitor;
    heap.scan_weak_roots(&mut weak_visitor);

    heap.set_update_refs_in_progress(false);
    heap.set_has_forwarded_objects(false);

    let cset = heap.collection_set_mut();
    for &index in cset.regions() {
        unsafe {
            (*heap.get_region(index))
                .make_trash()
                .expect("evacuated cset region must become trash");
        }
    }
    cset.clear();

    // World is stopped; rebuild directly.
    heap.free_set_mut().rebuild();
}
