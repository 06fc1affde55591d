use std::time::Instant;

use super::concurrent_gc::{finish_mark, finish_update_refs, prepare_evacuation};
use super::evacuation::evacuate_collection_set;
use super::heap::Heap;
use super::mark::{run_marking, MarkConfig, MarkRootVisitor};
use super::safepoint::SafepointSynchronize;
use super::update_refs::update_heap_references;
use super::{DegenPoint, PausePhase};

/// Stop-the-world continuation of an interrupted concurrent cycle.
///
/// The cases below form a Duff's-device-like ladder: it is the concurrent
/// cycle's phase sequence, entered at whichever phase had degenerated, and
/// run to the end under a single safepoint. Work already done concurrently
/// is kept: marking queues, the evacuation claim cursor and the update-refs
/// cursor all resume instead of restarting.
///
/// `collect` returns false when the degenerated pass itself cannot finish
/// (an evacuation allocation failure); the caller escalates to Full GC.
pub struct DegeneratedGC {
    heap: &'static Heap,
    degen_point: DegenPoint,
}

impl DegeneratedGC {
    pub fn new(heap: &'static Heap, degen_point: DegenPoint) -> Self {
        Self { heap, degen_point }
    }

    pub fn collect(&mut self) -> bool {
        let heap = self.heap;
        let start = Instant::now();

        SafepointSynchronize::begin(heap);
        let phase = PausePhase::new(heap.gc_id(), "Degenerated GC");
        log::info!(
            target: "gc",
            "Degenerated GC resuming from {:?}",
            self.degen_point
        );

        heap.clear_cancelled_gc();
        heap.retire_tlabs();

        let process_references = heap.heuristics().should_process_references();
        let unload_classes = heap.heuristics().should_unload_classes();
        let coalesce = heap.heuristics().should_coalesce_update_refs();
        let carry_forwarded = heap.has_forwarded_objects() && !heap.is_evacuation_in_progress();

        let mut point = self.degen_point;

        if point == DegenPoint::OutsideCycle {
            // Degenerating from outside a cycle means the heap is in bad
            // shape (heavy fragmentation or very low free space); run the
            // most aggressive cycle we can, entirely in this pause.
            heap.prepare_gc();
            heap.set_concurrent_mark_in_progress(true);
            let mut visitor =
                MarkRootVisitor::new(heap, heap.marking_context(), carry_forwarded);
            heap.scan_roots(&mut visitor, 0, 1);
            point = DegenPoint::ConcurrentMark;
        }

        if point == DegenPoint::ConcurrentMark {
            if heap.is_concurrent_mark_in_progress() {
                run_marking(
                    heap,
                    MarkConfig {
                        cancellable: false,
                        drain_satb: true,
                        count_liveness: true,
                        update_refs: carry_forwarded,
                    },
                );
                finish_mark(heap, carry_forwarded, process_references, unload_classes);
            }
            prepare_evacuation(heap);
            point = DegenPoint::ConcurrentEvac;
        }

        if point == DegenPoint::ConcurrentEvac {
            if heap.is_evacuation_in_progress() {
                // Continue claiming where the concurrent evacuators stopped.
                evacuate_collection_set(heap);
                if heap.cancelled_gc() {
                    // Out of space even under a pause; only Full GC helps now.
                    drop(phase);
                    SafepointSynchronize::end(heap);
                    return false;
                }
                heap.set_evacuation_in_progress(false);

                if coalesce {
                    log::debug!(target: "gc", "Coalescing update-refs into next cycle's mark");
                } else {
                    heap.set_update_refs_in_progress(true);
                    heap.reset_update_refs_cursor();
                }
            }
            point = DegenPoint::ConcurrentUpdateRefs;
        }

        if point == DegenPoint::ConcurrentUpdateRefs && heap.is_update_refs_in_progress() {
            // A resumed update-refs keeps its cursor: only the regions nobody
            // claimed yet are left to do.
            update_heap_references(heap, false);
            finish_update_refs(heap);
        }

        heap.recycle_trash();
        heap.notify_gc_progress();

        log::debug!(
            target: "gc",
            "Degenerated GC end in {:.3} ms",
            start.elapsed().as_micros() as f64 / 1000.0
        );
        drop(phase);
        SafepointSynchronize::end(heap);
        true
    }
}
