use std::ptr;

use crate::object::{HeapObjectHeader, Slot, SlotVisitor};
use crate::utils::formatted_size;

use super::heap::Heap;
use super::region::HeapRegion;
use super::tlab::Gclab;
use super::{AllocRequest, AllocType, GCCause};

/// One worker's evacuation state: a GCLAB refilled from the collector view
/// of the free set, plus statistics.
pub struct Evacuator<'a> {
    heap: &'a Heap,
    gclab: Gclab,
    evacuated_bytes: usize,
}

impl<'a> Evacuator<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self {
            heap,
            gclab: Gclab::new(),
            evacuated_bytes: 0,
        }
    }

    pub fn evacuated_bytes(&self) -> usize {
        self.evacuated_bytes
    }

    /// Copies `obj` out of its collection-set region and publishes the copy
    /// through the forwarding-word CAS. Exactly one of the racing evacuators
    /// wins; losers abandon their copy and adopt the winner's.
    ///
    /// On allocation failure the cycle is cancelled with `EvacOom` and the
    /// original object is returned; the caller notices the cancellation at
    /// its next checkpoint.
    pub fn evacuate_object(&mut self, obj: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
        unsafe {
            let fwd = (*obj).forwardee();
            if fwd != obj {
                return fwd;
            }

            let size = (*obj).size();
            let copy_addr = match self.allocate_for_evacuation(size) {
                Some(addr) => addr,
                None => {
                    log::info!(
                        target: "gc",
                        "Failed to evacuate {} object, cancelling cycle for Full GC",
                        formatted_size(size)
                    );
                    self.heap.cancel_gc(GCCause::EvacOom);
                    return obj;
                }
            };

            ptr::copy_nonoverlapping(obj as *const u8, copy_addr as *mut u8, size);
            let copy = copy_addr as *mut HeapObjectHeader;
            (*copy).reset_forwardee();

            let winner = (*obj).try_update_forwardee(copy);
            if winner == copy {
                self.evacuated_bytes += size;
                // The copy is live by construction. Mark it in the complete
                // bitmap, since the update-refs walk finds objects through
                // it and the copy's region was never marked through. Keep the
                // to-space region's liveness truthful as well.
                self.heap.marking_context().complete_bitmap().mark(copy_addr);
                let region = self
                    .heap
                    .get_region(self.heap.region_index(copy_addr));
                (*region).increase_live_data(size);
            }
            // The losing copy stays where it was allocated; the space is
            // plain garbage in a collector region and dies at the next
            // recycle.
            winner
        }
    }

    fn allocate_for_evacuation(&mut self, size: usize) -> Option<usize> {
        let addr = self.gclab.allocate(size);
        if !addr.is_null() {
            return Some(addr as usize);
        }

        let opts = self.heap.options();
        if size > opts.max_tlab_size {
            // Oversized copies go straight to a shared GC allocation.
            let mut req = AllocRequest::new(AllocType::SharedGc, size, size);
            let mem = self.heap.allocate_memory_for_gc(&mut req);
            return if mem.is_null() {
                None
            } else {
                Some(mem as usize)
            };
        }

        // Refill the GCLAB and retry.
        let desired = opts.max_tlab_size;
        let mut req = AllocRequest::new(AllocType::Gclab, size, desired);
        let mem = self.heap.allocate_memory_for_gc(&mut req);
        if mem.is_null() {
            return None;
        }
        self.gclab
            .initialize(mem as usize, mem as usize + req.actual_size());
        let addr = self.gclab.allocate(size);
        debug_assert!(!addr.is_null());
        Some(addr as usize)
    }
}

/// Evacuates every live object of one collection-set region, in ascending
/// address order off the complete mark bitmap.
fn evacuate_region(heap: &Heap, region: *mut HeapRegion, evac: &mut Evacuator) {
    let (bottom, top) = unsafe { ((*region).bottom(), (*region).top()) };
    let bitmap = heap.marking_context().complete_bitmap();

    let mut cursor = bottom;
    while let Some(addr) = bitmap.next_marked(cursor, top) {
        let obj = addr as *mut HeapObjectHeader;
        evac.evacuate_object(obj);
        // A claimed region is always finished so nobody has to revisit it;
        // only an evacuation OOM aborts mid-region, because the full
        // collection that follows re-examines everything anyway.
        if heap.cancelled_cause() == GCCause::EvacOom {
            return;
        }
        cursor = addr + crate::object::OBJECT_ALIGNMENT;
    }
}

/// Parallel evacuation of the collection set. Workers claim regions through
/// the cset cursor; a cancelled pass leaves unclaimed regions for the
/// degenerated continuation to pick up.
pub fn evacuate_collection_set(heap: &'static Heap) {
    heap.workers().scoped(|scope| {
        for _ in 0..heap.options().parallel_gc_threads {
            scope.execute(move || {
                let mut evac = Evacuator::new(heap);
                loop {
                    // Check before claiming: regions once claimed are fully
                    // evacuated, cancellation only stops further claims.
                    if heap.cancelled_gc() {
                        break;
                    }
                    let index = match heap.collection_set().claim_next() {
                        Some(index) => index,
                        None => break,
                    };
                    let region = heap.get_region(index);
                    debug_assert!(unsafe { (*region).is_cset() });
                    evacuate_region(heap, region, &mut evac);
                }
            });
        }
    });
}

/// Root visitor for the final-mark pause: any root still referring into the
/// collection set is evacuated on the spot and the root slot is healed, so
/// mutators resume on to-space copies only.
pub struct EvacuateUpdateRootsVisitor<'a, 'h> {
    heap: &'h Heap,
    evac: &'a mut Evacuator<'h>,
}

impl<'a, 'h> EvacuateUpdateRootsVisitor<'a, 'h> {
    pub fn new(heap: &'h Heap, evac: &'a mut Evacuator<'h>) -> Self {
        Self { heap, evac }
    }
}

impl<'a, 'h> SlotVisitor for EvacuateUpdateRootsVisitor<'a, 'h> {
    fn visit(&mut self, slot: Slot) {
        let obj = slot.load();
        if obj.is_null() {
            return;
        }
        unsafe {
            if self.heap.in_collection_set(obj as usize) {
                let target = self.evac.evacuate_object(obj);
                slot.store(target);
            } else {
                let fwd = (*obj).forwardee();
                if fwd != obj {
                    slot.store(fwd);
                }
            }
        }
    }
}

/// STW root evacuation, done before mutators resume after final mark.
pub fn evacuate_and_update_roots(heap: &Heap) {
    let mut evac = Evacuator::new(heap);
    let mut visitor = EvacuateUpdateRootsVisitor::new(heap, &mut evac);
    heap.scan_roots(&mut visitor, 0, 1);
}
