use crate::object::{HeapObjectHeader, Slot};

use super::heap::Heap;
use super::thread::MutatorThread;

/// Read barrier: resolves a reference through the forwarding word. Outside
/// evacuation/update-refs windows no object is forwarded and this collapses
/// to a flag check and pass-through.
#[inline(always)]
pub fn resolve(heap: &Heap, obj: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
    if obj.is_null() || !heap.has_forwarded_objects() {
        return obj;
    }
    unsafe { (*obj).forwardee() }
}

/// SATB pre-write barrier: while concurrent marking runs, the overwritten
/// reference value is logged so the snapshot the cycle started from stays
/// complete despite the mutation.
#[inline]
pub fn pre_write_barrier(thread: &MutatorThread, slot: Slot) {
    let heap = thread.heap();
    if heap.is_concurrent_mark_in_progress() {
        let old = slot.load();
        if !old.is_null() {
            unsafe {
                thread.satb_queue().enqueue(heap.satb_queue_set(), old);
            }
        }
    }
}

/// Reference store with both barriers applied: the pre-barrier snapshots the
/// old value, the store itself goes through the holder's current copy.
#[inline]
pub fn write_ref_field(
    thread: &MutatorThread,
    holder: *mut HeapObjectHeader,
    index: usize,
    value: *mut HeapObjectHeader,
) {
    let heap = thread.heap();
    let holder = resolve(heap, holder);
    unsafe {
        let slot = (*holder).slot(index);
        pre_write_barrier(thread, slot);
        slot.store(resolve(heap, value));
    }
}

/// Reference load with the read barrier applied.
#[inline]
pub fn read_ref_field(
    heap: &Heap,
    holder: *mut HeapObjectHeader,
    index: usize,
) -> *mut HeapObjectHeader {
    let holder = resolve(heap, holder);
    unsafe { resolve(heap, (*holder).slot(index).load()) }
}
