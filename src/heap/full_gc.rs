use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crate::object::{HeapObjectHeader, Slot, SlotVisitor};
use crate::utils::formatted_size;

use super::heap::Heap;
use super::mark::{run_marking, MarkConfig, MarkRootVisitor};
use super::region::HeapRegion;
use super::safepoint::SafepointSynchronize;
use super::PausePhase;

/// The last line of defense: a fully stop-the-world sliding mark-compact.
/// It owes nothing to the concurrent machinery it cleans up after (any
/// half-done cycle state is reset first) and it is guaranteed to make
/// progress because nothing runs concurrently with it.
///
/// Four strict phases, parallel within each:
/// 1. mark from roots (through forwarding words, healing as it goes),
/// 2. compute compacted addresses per deterministic worker slice,
/// 3. adjust every root and heap pointer to the computed addresses,
/// 4. copy objects into place and rebuild the region states.
pub struct FullGC {
    heap: &'static Heap,
    /// Planned post-compaction `top` per region, filled in phase 2.
    new_tops: Vec<AtomicUsize>,
}

struct AdjustPointersVisitor;

impl SlotVisitor for AdjustPointersVisitor {
    #[inline]
    fn visit(&mut self, slot: Slot) {
        let obj = slot.load();
        if !obj.is_null() {
            unsafe {
                slot.store((*obj).forwardee());
            }
        }
    }
}

impl FullGC {
    pub fn new(heap: &'static Heap) -> Self {
        let mut new_tops = Vec::with_capacity(heap.num_regions());
        for i in 0..heap.num_regions() {
            new_tops.push(AtomicUsize::new(unsafe { (*heap.get_region(i)).bottom() }));
        }
        Self { heap, new_tops }
    }

    pub fn collect(&mut self) {
        let heap = self.heap;
        let start = Instant::now();

        SafepointSynchronize::begin(heap);
        let phase = PausePhase::new(heap.gc_id(), "Full GC");
        heap.set_full_gc_in_progress(true);

        self.reset_concurrent_state();
        self.phase1_mark();
        self.phase2_compute_addresses();
        self.phase3_adjust_pointers();
        self.phase4_compact();
        self.finish();

        heap.set_full_gc_in_progress(false);
        heap.clear_cancelled_gc();

        log::info!(
            target: "gc",
            "Full GC done in {:.3} ms, {} used after compaction",
            start.elapsed().as_micros() as f64 / 1000.0,
            formatted_size(heap.used()),
        );
        drop(phase);
        SafepointSynchronize::end(heap);
    }

    /// Brings the heap back to an invariant-consistent baseline: whatever
    /// the interrupted cycle left behind, be it active marking, queued SATB
    /// buffers or a half-evacuated collection set, is cancelled before the
    /// compaction starts.
    fn reset_concurrent_state(&mut self) {
        let heap = self.heap;

        heap.retire_tlabs();
        if heap.is_concurrent_mark_in_progress() {
            heap.set_concurrent_mark_in_progress(false);
        }
        heap.satb_queue_set().abandon();
        heap.marking_context().mark_queues().abandon();
        heap.set_evacuation_in_progress(false);
        heap.set_update_refs_in_progress(false);

        // Collection-set regions rejoin the ordinary population; their
        // unevacuated survivors are just live objects like any other.
        let cset = heap.collection_set_mut();
        for &index in cset.regions() {
            unsafe {
                (*heap.get_region(index))
                    .make_regular_allocation()
                    .expect("cset region resets to regular for full gc");
            }
        }
        cset.clear();
    }

    fn phase1_mark(&mut self) {
        let heap = self.heap;
        heap.prepare_gc();

        // Forwarding words may point at evacuated copies; marking resolves
        // through them, so the closure lands on current copies only.
        let mut visitor = MarkRootVisitor::new(heap, heap.marking_context(), true);
        heap.scan_roots(&mut visitor, 0, 1);

        run_marking(
            heap,
            MarkConfig {
                cancellable: false,
                drain_satb: true,
                count_liveness: true,
                update_refs: true,
            },
        );

        heap.process_weak_refs(true);
        heap.marking_context().mark_complete();
        heap.marking_context().swap_bitmaps();

        // Dead humongous objects free whole region runs for the slide.
        for i in 0..heap.num_regions() {
            let region = heap.get_region(i);
            unsafe {
                if (*region).is_humongous_start() {
                    let obj = (*region).bottom() as *mut HeapObjectHeader;
                    if !heap.marking_context().is_marked_complete(obj) {
                        heap.trash_humongous_region_at(region);
                    }
                }
            }
        }
    }

    /// Deterministic contiguous region slices per worker; the same heap
    /// state and worker count always produce the same packing.
    fn slice(&self, worker: usize, nworkers: usize) -> std::ops::Range<usize> {
        let n = self.heap.num_regions();
        let per = (n + nworkers - 1) / nworkers;
        let start = (worker * per).min(n);
        let end = ((worker + 1) * per).min(n);
        start..end
    }

    /// Regions that participate in sliding, as source and destination alike.
    /// Pinned regions hold their objects in place; humongous runs are
    /// handled in their own pass.
    fn is_slide_region(region: *mut HeapRegion) -> bool {
        unsafe { !(*region).is_humongous() && !(*region).is_pinned() }
    }

    fn phase2_compute_addresses(&mut self) {
        let heap = self.heap;
        let nworkers = heap.options().parallel_gc_threads;
        let new_tops = &self.new_tops;
        let this: &FullGC = self;

        heap.workers().scoped(|scope| {
            for worker in 0..nworkers {
                scope.execute(move || {
                    this.compute_slice(worker, nworkers, new_tops);
                });
            }
        });

        self.plan_humongous_moves();
    }

    fn compute_slice(&self, worker: usize, nworkers: usize, new_tops: &[AtomicUsize]) {
        let heap = self.heap;
        let bitmap = heap.marking_context().complete_bitmap();
        let slice = self.slice(worker, nworkers);

        // Destination cursor walks the same slice the sources come from;
        // cumulative live never exceeds cumulative capacity, so the write
        // cursor can never pass the read cursor.
        let dests: Vec<usize> = slice
            .clone()
            .filter(|&i| Self::is_slide_region(heap.get_region(i)))
            .collect();
        let mut dest_at = 0usize;
        let mut dest_cursor = match dests.first() {
            Some(&i) => unsafe { (*heap.get_region(i)).bottom() },
            None => return,
        };

        for i in slice {
            let region = heap.get_region(i);
            if !Self::is_slide_region(region) {
                continue;
            }
            let (bottom, top) = unsafe { ((*region).bottom(), (*region).top()) };
            bitmap.iter_marked(bottom, top, |addr| {
                let obj = addr as *mut HeapObjectHeader;
                let size = unsafe { (*obj).size() };

                // Advance to the next destination region when this one is
                // out of room.
                loop {
                    let dest_region = heap.get_region(dests[dest_at]);
                    let dest_end = unsafe { (*dest_region).end() };
                    if dest_cursor + size <= dest_end {
                        break;
                    }
                    new_tops[dests[dest_at]].store(dest_cursor, Ordering::Relaxed);
                    dest_at += 1;
                    assert!(dest_at < dests.len(), "sliding ran out of destination space");
                    dest_cursor = unsafe { (*heap.get_region(dests[dest_at])).bottom() };
                }

                unsafe {
                    // Destinations must be writable before phase 4 copies
                    // into them; regions in a slice are touched by exactly
                    // one worker, so this needs no lock.
                    let dest_region = heap.get_region(dests[dest_at]);
                    if !(*dest_region).is_committed() {
                        heap.commit_region(dest_region);
                    }
                    (*obj).set_forwardee_raw(dest_cursor);
                }
                dest_cursor += size;
            });
        }

        new_tops[dests[dest_at]].store(dest_cursor, Ordering::Relaxed);
    }

    /// Humongous objects move only when their current run collides with
    /// planned compacted content; with humongous runs excluded from the
    /// destination lists that cannot happen, so in practice each object is
    /// found already occupying a valid slot and stays. The backward search
    /// for a fully empty suffix run is kept for the general case.
    fn plan_humongous_moves(&mut self) {
        let heap = self.heap;
        for i in (0..heap.num_regions()).rev() {
            let region = heap.get_region(i);
            unsafe {
                if !(*region).is_humongous_start() {
                    continue;
                }
                let obj = (*region).bottom() as *mut HeapObjectHeader;
                let required = heap.options().required_regions((*obj).size());

                let collides = (i..i + required).any(|j| {
                    self.new_tops[j].load(Ordering::Relaxed) > (*heap.get_region(j)).bottom()
                });
                if !collides {
                    continue; // already in a valid slot, avoid the move
                }

                // Find the rightmost fully free run to relocate into.
                let mut run_end = heap.num_regions();
                while run_end >= required {
                    let candidate = run_end - required;
                    let free = (candidate..run_end).all(|j| {
                        let r = heap.get_region(j);
                        Self::is_slide_region(r)
                            && self.new_tops[j].load(Ordering::Relaxed) == (*r).bottom()
                    });
                    if free {
                        let dest = (*heap.get_region(candidate)).bottom();
                        (*obj).set_forwardee_raw(dest);
                        self.new_tops[candidate].store(dest + (*obj).size(), Ordering::Relaxed);
                        break;
                    }
                    run_end -= 1;
                }
            }
        }
    }

    fn phase3_adjust_pointers(&mut self) {
        let heap = self.heap;

        let mut roots_visitor = AdjustPointersVisitor;
        heap.scan_roots(&mut roots_visitor, 0, 1);
        heap.scan_weak_roots(&mut roots_visitor);

        let nworkers = heap.options().parallel_gc_threads;
        let this: &FullGC = self;
        heap.workers().scoped(|scope| {
            for worker in 0..nworkers {
                scope.execute(move || {
                    let bitmap = heap.marking_context().complete_bitmap();
                    for i in this.slice(worker, nworkers) {
                        let region = heap.get_region(i);
                        unsafe {
                            if (*region).is_humongous_cont() || (*region).is_trash() {
                                continue;
                            }
                            let mut visitor = AdjustPointersVisitor;
                            bitmap.iter_marked((*region).bottom(), (*region).top(), |addr| {
                                let obj = addr as *mut HeapObjectHeader;
                                (*obj).visit_edges(&mut visitor);
                            });
                        }
                    }
                });
            }
        });
    }

    fn phase4_compact(&mut self) {
        let heap = self.heap;
        let nworkers = heap.options().parallel_gc_threads;
        let this: &FullGC = self;

        heap.workers().scoped(|scope| {
            for worker in 0..nworkers {
                scope.execute(move || {
                    let bitmap = heap.marking_context().complete_bitmap();
                    for i in this.slice(worker, nworkers) {
                        let region = heap.get_region(i);
                        if !Self::is_slide_region(region) {
                            continue;
                        }
                        let (bottom, top) = unsafe { ((*region).bottom(), (*region).top()) };
                        // Ascending scan with destinations at or below the
                        // source keeps the overlapping copies safe.
                        bitmap.iter_marked(bottom, top, |addr| {
                            let obj = addr as *mut HeapObjectHeader;
                            unsafe {
                                let dest = (*obj).forwardee();
                                if dest as usize != addr {
                                    std::ptr::copy(
                                        addr as *const u8,
                                        dest as *mut u8,
                                        (*obj).size(),
                                    );
                                }
                                (*dest).reset_forwardee();
                            }
                        });
                    }
                });
            }
        });

        // Humongous copies, if any were planned, happen outside the slices.
        for i in 0..heap.num_regions() {
            let region = heap.get_region(i);
            unsafe {
                if !(*region).is_humongous_start() {
                    continue;
                }
                let obj = (*region).bottom() as *mut HeapObjectHeader;
                let dest = (*obj).forwardee();
                if dest as usize != obj as usize {
                    std::ptr::copy(obj as *const u8, dest as *mut u8, (*obj).size());
                    (*dest).reset_forwardee();
                }
            }
        }
    }

    /// Rebuilds region states, accounting and the free set from the plan.
    fn finish(&mut self) {
        let heap = self.heap;
        let mut used = 0usize;

        // Humongous relocations change region states wholesale; collect the
        // moves before rewriting anything. The old header still carries the
        // destination in its forwarding word (phase 4 only reset the copy).
        let mut humongous_moves: Vec<(usize, usize, usize)> = Vec::new();
        for i in 0..heap.num_regions() {
            let region = heap.get_region(i);
            unsafe {
                if (*region).is_humongous_start() {
                    let obj = (*region).bottom() as *mut HeapObjectHeader;
                    let fwd = (*obj).forwardee();
                    if fwd as usize != obj as usize {
                        let required = heap.options().required_regions((*fwd).size());
                        humongous_moves.push((i, heap.region_index(fwd as usize), required));
                    }
                }
            }
        }

        for (old_start, new_start, count) in humongous_moves {
            unsafe {
                for k in 0..count {
                    (*heap.get_region(old_start + k))
                        .make_trash()
                        .expect("vacated humongous region must become trash");
                }
                for k in 0..count {
                    let new_region = heap.get_region(new_start + k);
                    if (*new_region).is_regular() {
                        (*new_region)
                            .make_trash()
                            .expect("empty regular region must become trash");
                    }
                    if (*new_region).is_trash() {
                        (*new_region).recycle();
                    }
                    if !(*new_region).is_committed() {
                        heap.commit_region(new_region);
                    }
                    if k == 0 {
                        (*new_region)
                            .make_humongous_start()
                            .expect("relocation target must accept humongous start");
                    } else {
                        (*new_region)
                            .make_humongous_cont()
                            .expect("relocation target must accept humongous continuation");
                    }
                    (*new_region).set_top((*new_region).end());
                }
            }
        }

        for i in 0..heap.num_regions() {
            let region = heap.get_region(i);
            unsafe {
                if (*region).is_humongous() {
                    let start = if (*region).is_humongous_start() {
                        region
                    } else {
                        // Walk back to the start region for the size.
                        let mut j = i;
                        while !(*heap.get_region(j)).is_humongous_start() {
                            j -= 1;
                        }
                        heap.get_region(j)
                    };
                    let obj = (*start).bottom() as *mut HeapObjectHeader;
                    if std::ptr::eq(start, region) {
                        (*region).set_live_data((*obj).size());
                    }
                    used += (*region).used();
                    continue;
                }
                if (*region).is_pinned() {
                    used += (*region).used();
                    continue;
                }

                let new_top = self.new_tops[i].load(Ordering::Relaxed);
                if new_top > (*region).bottom() {
                    if (*region).is_trash() {
                        (*region).recycle();
                    }
                    if (*region).is_empty() {
                        if !(*region).is_committed() {
                            heap.commit_region(region);
                        }
                        (*region)
                            .make_regular_allocation()
                            .expect("compaction target must become regular");
                    }
                    (*region).set_top(new_top);
                    (*region).set_live_data(new_top - (*region).bottom());
                    used += (*region).used();
                } else {
                    if (*region).is_regular() {
                        (*region)
                            .make_trash()
                            .expect("emptied region must become trash");
                    }
                    if (*region).is_trash() {
                        (*region).recycle();
                    }
                    (*region).clear_live_data();
                }
            }
        }

        heap.set_used(used);
        heap.set_has_forwarded_objects(false);

        // Both bitmaps describe pre-compaction addresses now; wipe them.
        heap.marking_context().next_bitmap().clear();
        heap.marking_context().complete_bitmap().clear();
        heap.marking_context().mark_incomplete();

        heap.free_set_mut().rebuild();

        if heap.free_set().available() > 0 {
            heap.notify_gc_progress();
        } else {
            heap.notify_no_gc_progress();
        }
    }
}
