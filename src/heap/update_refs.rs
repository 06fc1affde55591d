use crate::object::{HeapObjectHeader, Slot, SlotVisitor};

use super::heap::Heap;
use super::region::HeapRegion;

/// Rewrites one reference through the forwarding word. The workhorse of both
/// the concurrent update-refs walk and the final root-update pause.
pub struct UpdateRefsVisitor;

impl SlotVisitor for UpdateRefsVisitor {
    #[inline]
    fn visit(&mut self, slot: Slot) {
        let obj = slot.load();
        if obj.is_null() {
            return;
        }
        unsafe {
            let fwd = (*obj).forwardee();
            if fwd != obj {
                slot.store(fwd);
            }
        }
    }
}

/// Updates every reference held by objects of one region, then clears the
/// region's complete-bitmap coverage so the next cycle starts from a clean
/// slate.
fn update_region_references(heap: &Heap, region: *mut HeapRegion) {
    let mut visitor = UpdateRefsVisitor;
    unsafe {
        if (*region).is_humongous_start() {
            let obj = (*region).bottom() as *mut HeapObjectHeader;
            (*obj).visit_edges(&mut visitor);
        } else {
            let bitmap = heap.marking_context().complete_bitmap();
            bitmap.iter_marked((*region).bottom(), (*region).top(), |addr| {
                let obj = addr as *mut HeapObjectHeader;
                (*obj).visit_edges(&mut visitor);
            });
        }
        heap.marking_context().clear_complete_region(&*region);
    }
}

/// Whether a region participates in the update-refs walk: it holds objects
/// and is not about to be recycled as part of the collection set.
fn wants_update(heap: &Heap, index: usize) -> bool {
    if heap.collection_set().is_in(index) {
        return false;
    }
    let region = heap.get_region(index);
    unsafe { (*region).is_active() && !(*region).is_humongous_cont() }
}

/// Walks all non-cset regions in parallel, rewriting stale references.
/// Workers claim regions through the heap's update-refs cursor; on
/// cancellation the cursor keeps its position, and the degenerated
/// continuation simply continues claiming where the concurrent pass stopped.
pub fn update_heap_references(heap: &'static Heap, cancellable: bool) {
    heap.workers().scoped(|scope| {
        for _ in 0..heap.options().parallel_gc_threads {
            scope.execute(move || {
                loop {
                    // Check before claiming: a claimed region is always
                    // finished, so the resumed pass can trust the cursor.
                    if cancellable && heap.cancelled_gc() {
                        break;
                    }
                    let index = match heap.claim_update_refs_region() {
                        Some(index) => index,
                        None => break,
                    };
                    if wants_update(heap, index) {
                        update_region_references(heap, heap.get_region(index));
                    }
                }
            });
        }
    });
}

/// Final-update-refs pause: roots are rewritten last, after which no
/// from-space reference exists anywhere and the cset can be recycled.
pub fn update_roots(heap: &Heap) {
    let mut visitor = UpdateRefsVisitor;
    heap.scan_roots(&mut visitor, 0, 1);
}
