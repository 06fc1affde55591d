use std::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::object::HeapObjectHeader;

use super::mark::MarkQueueSet;
use super::mark_bitmap::MarkBitmap;
use super::region::HeapRegion;
use super::shared_vars::SharedFlag;

/// Marking state shared by all collectors: two mark bitmaps covering the
/// whole reservation plus the work queues.
///
/// The *next* bitmap is the one the in-flight marking writes into; the
/// *complete* bitmap holds the results of the most recently finished marking
/// and is what evacuation and reference updating walk. Swapping the roles at
/// the end of final mark publishes the freshly computed liveness in O(1).
pub struct MarkingContext {
    bitmaps: [MarkBitmap; 2],
    next_index: AtomicUsize,
    is_complete: SharedFlag,
    mark_queues: MarkQueueSet,
}

impl MarkingContext {
    pub fn new(covered_start: usize, covered_size: usize, max_queues: usize) -> Self {
        Self {
            bitmaps: [
                MarkBitmap::new(covered_start, covered_size),
                MarkBitmap::new(covered_start, covered_size),
            ],
            next_index: AtomicUsize::new(0),
            is_complete: SharedFlag::new(),
            mark_queues: MarkQueueSet::new(max_queues),
        }
    }

    pub fn mark_queues(&self) -> &MarkQueueSet {
        &self.mark_queues
    }

    pub fn next_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[self.next_index.load(Ordering::Acquire)]
    }

    pub fn complete_bitmap(&self) -> &MarkBitmap {
        &self.bitmaps[1 - self.next_index.load(Ordering::Acquire)]
    }

    /// Exchanges the roles of the two bitmaps. The full fence publishes every
    /// mark written into the next bitmap before any worker of the new cycle
    /// reads it as complete.
    pub fn swap_bitmaps(&self) {
        fence(Ordering::SeqCst);
        self.next_index.fetch_xor(1, Ordering::SeqCst);
    }

    /// Marks the object in the next bitmap. True if this thread won the
    /// marking race; competing threads get false and must not push the
    /// object again.
    #[inline]
    pub fn mark(&self, obj: *const HeapObjectHeader) -> bool {
        self.next_bitmap().mark(obj as usize)
    }

    #[inline]
    pub fn is_marked_next(&self, obj: *const HeapObjectHeader) -> bool {
        self.next_bitmap().is_marked(obj as usize)
    }

    #[inline]
    pub fn is_marked_complete(&self, obj: *const HeapObjectHeader) -> bool {
        self.complete_bitmap().is_marked(obj as usize)
    }

    pub fn clear_next_bitmap(&self) {
        self.next_bitmap().clear();
    }

    /// Clears the complete-bitmap coverage of one region, typically right
    /// after its references were updated, so the next cycle starts clean.
    pub fn clear_complete_region(&self, region: &HeapRegion) {
        self.complete_bitmap()
            .clear_range(region.bottom(), region.end());
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete.is_set()
    }

    pub fn mark_complete(&self) {
        self.is_complete.set();
    }

    pub fn mark_incomplete(&self) {
        self.is_complete.unset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x40000;
    const SIZE: usize = 64 * 1024;

    #[test]
    fn swap_round_trips() {
        let ctx = MarkingContext::new(BASE, SIZE, 1);
        let next_before = ctx.next_bitmap() as *const MarkBitmap;
        let complete_before = ctx.complete_bitmap() as *const MarkBitmap;
        assert_ne!(next_before, complete_before);

        ctx.swap_bitmaps();
        assert_eq!(ctx.next_bitmap() as *const MarkBitmap, complete_before);
        assert_eq!(ctx.complete_bitmap() as *const MarkBitmap, next_before);

        ctx.swap_bitmaps();
        assert_eq!(ctx.next_bitmap() as *const MarkBitmap, next_before);
        assert_eq!(ctx.complete_bitmap() as *const MarkBitmap, complete_before);
    }

    #[test]
    fn marks_move_to_complete_on_swap() {
        let ctx = MarkingContext::new(BASE, SIZE, 1);
        let obj = (BASE + 256) as *const HeapObjectHeader;

        assert!(ctx.mark(obj));
        assert!(!ctx.mark(obj));
        assert!(ctx.is_marked_next(obj));
        assert!(!ctx.is_marked_complete(obj));

        ctx.swap_bitmaps();
        assert!(ctx.is_marked_complete(obj));
        assert!(!ctx.is_marked_next(obj));
    }
}
