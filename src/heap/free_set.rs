use std::ptr::null_mut;

use crate::utils::formatted_size;

use super::{
    align_down,
    heap::Heap,
    region::{HeapOptions, HeapRegion},
    AllocRequest, DynBitmap,
};

/// The free-region set, partitioned into two views with independent bitmaps:
/// the *mutator* view serves application allocations and is scanned
/// left-to-right; the *collector* view serves evacuation copies and is
/// scanned right-to-left. The opposite scan directions keep the two
/// populations at opposite ends of the region index space, which limits
/// interleaving of short-lived mutator regions with long-lived to-space
/// regions.
pub struct RegionFreeSet {
    heap: *mut Heap,
    mutator_free_bitmap: DynBitmap,
    collector_free_bitmap: DynBitmap,
    mutator_leftmost: usize,
    mutator_rightmost: usize,
    collector_leftmost: usize,
    collector_rightmost: usize,
    max: usize,
    capacity: usize,
    used: usize,
}

impl RegionFreeSet {
    pub fn new(_opts: &HeapOptions) -> Self {
        Self {
            heap: null_mut(),
            mutator_free_bitmap: DynBitmap::contained(0),
            collector_free_bitmap: DynBitmap::contained(0),
            mutator_leftmost: 0,
            mutator_rightmost: 0,
            collector_leftmost: 0,
            collector_rightmost: 0,
            max: 0,
            capacity: 0,
            used: 0,
        }
    }

    pub(crate) fn set_heap(&mut self, heap: *mut Heap) {
        self.heap = heap;
        let count = self.heap().options().region_count;
        self.mutator_free_bitmap = DynBitmap::contained(count);
        self.collector_free_bitmap = DynBitmap::contained(count);
        self.max = count;
    }

    fn heap(&self) -> &'static mut Heap {
        unsafe { &mut *self.heap }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        debug_assert!(self.used <= self.capacity);
        self.capacity - self.used
    }

    pub fn increase_used(&mut self, bytes: usize) {
        self.used += bytes;
        debug_assert!(
            self.used <= self.capacity,
            "must not use more than we have: used {}, capacity {}",
            self.used,
            self.capacity
        );
    }

    pub fn is_mutator_free(&self, idx: usize) -> bool {
        self.mutator_free_bitmap.get(idx)
    }

    pub fn is_collector_free(&self, idx: usize) -> bool {
        self.collector_free_bitmap.get(idx)
    }

    pub fn mutator_count(&self) -> usize {
        self.mutator_free_bitmap.count_ones()
    }

    pub fn collector_count(&self) -> usize {
        self.collector_free_bitmap.count_ones()
    }

    pub fn mutator_bounds(&self) -> (usize, usize) {
        (self.mutator_leftmost, self.mutator_rightmost)
    }

    pub fn collector_bounds(&self) -> (usize, usize) {
        (self.collector_leftmost, self.collector_rightmost)
    }

    pub fn clear(&mut self) {
        self.mutator_free_bitmap.clear();
        self.collector_free_bitmap.clear();
        self.mutator_leftmost = self.max;
        self.mutator_rightmost = 0;
        self.collector_leftmost = self.max;
        self.collector_rightmost = 0;
        self.capacity = 0;
        self.used = 0;
    }

    /// Repartitions the free set from current region states. Every region
    /// that can still serve allocations lands in the mutator view, except for
    /// an evacuation reserve of empty regions taken from the right end, which
    /// seeds the collector view. Caller holds the heap lock.
    pub fn rebuild(&mut self) {
        self.clear();

        let heap = self.heap();
        for i in 0..heap.num_regions() {
            unsafe {
                let region = heap.get_region(i);
                if (*region).is_alloc_allowed() || (*region).is_trash() {
                    if self.alloc_capacity(region) == 0 {
                        continue; // would surely fail allocation, do not add
                    }
                    self.capacity += self.alloc_capacity(region);
                    self.mutator_free_bitmap.set(i, true);
                }
            }
        }

        // Carve the evacuation reserve off the right end, from fully empty
        // regions only.
        let reserve_regions =
            heap.num_regions() * heap.options().evac_reserve / 100;
        let mut reserved = 0;
        let mut i = heap.num_regions();
        while reserved < reserve_regions && i > 0 {
            i -= 1;
            if !self.mutator_free_bitmap.get(i) {
                continue;
            }
            let region = heap.get_region(i);
            if self.can_allocate_from(region) {
                self.mutator_free_bitmap.set(i, false);
                self.collector_free_bitmap.set(i, true);
                reserved += 1;
            }
        }

        self.recompute_bounds();
    }

    fn recompute_bounds(&mut self) {
        self.mutator_leftmost = 0;
        self.mutator_rightmost = self.max.saturating_sub(1);
        self.collector_leftmost = 0;
        self.collector_rightmost = self.max.saturating_sub(1);
        self.adjust_mutator_bounds();
        self.adjust_collector_bounds();
    }

    fn adjust_mutator_bounds(&mut self) {
        while self.mutator_leftmost < self.max && !self.is_mutator_free(self.mutator_leftmost) {
            self.mutator_leftmost += 1;
        }
        while self.mutator_rightmost > 0 && !self.is_mutator_free(self.mutator_rightmost) {
            self.mutator_rightmost -= 1;
        }
    }

    fn adjust_collector_bounds(&mut self) {
        while self.collector_leftmost < self.max && !self.is_collector_free(self.collector_leftmost)
        {
            self.collector_leftmost += 1;
        }
        while self.collector_rightmost > 0 && !self.is_collector_free(self.collector_rightmost) {
            self.collector_rightmost -= 1;
        }
    }

    fn touches_mutator_bounds(&self, num: usize) -> bool {
        num == self.mutator_leftmost || num == self.mutator_rightmost
    }

    fn touches_collector_bounds(&self, num: usize) -> bool {
        num == self.collector_leftmost || num == self.collector_rightmost
    }

    pub fn can_allocate_from(&self, r: *mut HeapRegion) -> bool {
        unsafe { (*r).is_empty() || (*r).is_trash() }
    }

    pub fn alloc_capacity(&self, r: *mut HeapRegion) -> usize {
        unsafe {
            if (*r).is_trash() {
                (*r).size()
            } else {
                (*r).free()
            }
        }
    }

    /// Allocation entry point; caller holds the heap lock. Returns null on
    /// failure, which the heap translates into GC-and-retry.
    pub fn allocate(&mut self, req: &mut AllocRequest, in_new_region: &mut bool) -> *mut u8 {
        if req.size() > self.heap().options().humongous_threshold_bytes {
            assert!(
                !req.alloc_type().is_lab_alloc(),
                "humongous allocations never come from LAB refills"
            );
            *in_new_region = true;
            self.allocate_contiguous(req)
        } else {
            self.allocate_single(req, in_new_region)
        }
    }

    fn allocate_single(&mut self, req: &mut AllocRequest, in_new_region: &mut bool) -> *mut u8 {
        if req.alloc_type().is_mutator_alloc() {
            // Mutators scan their view forward from the leftmost free region.
            for idx in self.mutator_leftmost..=self.mutator_rightmost.min(self.max.saturating_sub(1))
            {
                if self.is_mutator_free(idx) {
                    let result =
                        self.try_allocate_in(self.heap().get_region(idx), req, in_new_region);
                    if !result.is_null() {
                        return result;
                    }
                }
            }

            // Steal a fully empty region from the collector view.
            for idx in (self.collector_leftmost
                ..=self.collector_rightmost.min(self.max.saturating_sub(1)))
                .rev()
            {
                if self.is_collector_free(idx)
                    && self.can_allocate_from(self.heap().get_region(idx))
                {
                    self.flip_to_mutator(idx);
                    let result =
                        self.try_allocate_in(self.heap().get_region(idx), req, in_new_region);
                    if !result.is_null() {
                        return result;
                    }
                }
            }
        } else {
            // Collector allocations scan their view backward from the
            // rightmost free region.
            for idx in (self.collector_leftmost
                ..=self.collector_rightmost.min(self.max.saturating_sub(1)))
                .rev()
            {
                if self.is_collector_free(idx) {
                    let result =
                        self.try_allocate_in(self.heap().get_region(idx), req, in_new_region);
                    if !result.is_null() {
                        return result;
                    }
                }
            }

            // Steal a fully empty region from the mutator view; partially
            // used mutator regions stay with the mutator so allocation causes
            // do not mix within a region.
            for idx in
                (self.mutator_leftmost..=self.mutator_rightmost.min(self.max.saturating_sub(1)))
                    .rev()
            {
                if self.is_mutator_free(idx) && self.can_allocate_from(self.heap().get_region(idx))
                {
                    self.flip_to_collector(idx);
                    let result =
                        self.try_allocate_in(self.heap().get_region(idx), req, in_new_region);
                    if !result.is_null() {
                        return result;
                    }
                }
            }

            // With mixed allocation enabled, dip into non-empty mutator
            // regions as the last resort before failing the evacuation.
            if self.heap().options().allow_mixed_alloc {
                for idx in
                    (self.mutator_leftmost..=self.mutator_rightmost.min(self.max.saturating_sub(1)))
                        .rev()
                {
                    if self.is_mutator_free(idx) {
                        let result =
                            self.try_allocate_in(self.heap().get_region(idx), req, in_new_region);
                        if !result.is_null() {
                            return result;
                        }
                    }
                }
            }
        }

        null_mut()
    }

    fn flip_to_mutator(&mut self, idx: usize) {
        debug_assert!(self.collector_free_bitmap.get(idx));
        self.collector_free_bitmap.set(idx, false);
        self.mutator_free_bitmap.set(idx, true);
        self.mutator_leftmost = self.mutator_leftmost.min(idx);
        self.mutator_rightmost = self.mutator_rightmost.max(idx);
        if self.touches_collector_bounds(idx) {
            self.adjust_collector_bounds();
        }
    }

    fn flip_to_collector(&mut self, idx: usize) {
        debug_assert!(self.mutator_free_bitmap.get(idx));
        self.mutator_free_bitmap.set(idx, false);
        self.collector_free_bitmap.set(idx, true);
        self.collector_leftmost = self.collector_leftmost.min(idx);
        self.collector_rightmost = self.collector_rightmost.max(idx);
        if self.touches_mutator_bounds(idx) {
            self.adjust_mutator_bounds();
        }
    }

    pub fn try_recycle_trashed(&mut self, r: *mut HeapRegion) {
        unsafe {
            if (*r).is_trash() {
                self.heap().decrease_used((*r).used());
                (*r).recycle();
            }
        }
    }

    fn try_allocate_in(
        &mut self,
        region: *mut HeapRegion,
        req: &mut AllocRequest,
        in_new_region: &mut bool,
    ) -> *mut u8 {
        unsafe {
            debug_assert!(
                self.alloc_capacity(region) != 0,
                "should avoid full regions on this path: {}",
                (*region).index()
            );

            self.try_recycle_trashed(region);

            if !(*region).is_committed() {
                self.heap().commit_region(region);
            }

            *in_new_region = (*region).is_empty();
            if (*region).is_empty() {
                (*region)
                    .make_regular_allocation()
                    .expect("empty region must accept allocation");
            }

            let mut size = req.size();
            let result;
            if self.heap().options().elastic_tlab && req.alloc_type().is_lab_alloc() {
                // LAB refills shrink to whatever the region still holds, as
                // long as the minimum is met.
                let free = align_down((*region).free(), crate::object::OBJECT_ALIGNMENT);
                if size > free {
                    size = free;
                }
                if size >= req.min_size() {
                    result = (*region).allocate(size, req.alloc_type());
                } else {
                    result = null_mut();
                }
            } else {
                result = (*region).allocate(size, req.alloc_type());
            }

            if !result.is_null() {
                self.increase_used(size);
                self.heap().increase_used(size);
                req.set_actual_size(size);
            }

            if result.is_null() || (*region).free() < self.heap().options().min_tlab_size {
                // Region cannot serve this or future allocations; retire it.
                // The unusable tail is counted as used so the availability
                // numbers the heuristics see stay truthful.
                self.retire(region);
            }

            result
        }
    }

    fn retire(&mut self, region: *mut HeapRegion) {
        unsafe {
            let waste = (*region).free();
            if waste > 0 {
                self.increase_used(waste);
                self.heap().notify_mutator_alloc(waste, true);
            }

            let num = (*region).index();
            let in_mutator = self.mutator_free_bitmap.get(num);
            let in_collector = self.collector_free_bitmap.get(num);
            debug_assert!(
                !(in_mutator && in_collector),
                "region {} present in both free views",
                num
            );

            if in_mutator {
                self.mutator_free_bitmap.set(num, false);
                if self.touches_mutator_bounds(num) {
                    self.adjust_mutator_bounds();
                }
            }
            if in_collector {
                self.collector_free_bitmap.set(num, false);
                if self.touches_collector_bounds(num) {
                    self.adjust_collector_bounds();
                }
            }
        }
    }

    /// Carves a run of `ceil(size / region_size)` contiguous, fully empty
    /// mutator regions for one humongous object. Biased toward the beginning
    /// of the heap.
    fn allocate_contiguous(&mut self, req: &mut AllocRequest) -> *mut u8 {
        let heap = self.heap();
        let size = req.size();
        let num = heap.options().required_regions(size);

        if num > self.mutator_count() {
            return null_mut();
        }

        let mut beg = self.mutator_leftmost;
        let mut end = beg;

        loop {
            if end >= self.max {
                return null_mut();
            }

            // The run must be adjacent, free and completely empty; anything
            // else restarts the window just past the offender.
            if !self.is_mutator_free(end) || !self.can_allocate_from(heap.get_region(end)) {
                end += 1;
                beg = end;
                continue;
            }

            if end - beg + 1 == num {
                break;
            }

            end += 1;
        }

        let region_size = heap.options().region_size_bytes;
        let remainder = size & heap.options().region_size_bytes_mask;

        for i in beg..=end {
            let r = heap.get_region(i);
            self.try_recycle_trashed(r);
            unsafe {
                if !(*r).is_committed() {
                    heap.commit_region(r);
                }
                if i == beg {
                    (*r).make_humongous_start()
                        .expect("empty region must accept humongous start");
                } else {
                    (*r).make_humongous_cont()
                        .expect("empty region must accept humongous continuation");
                }
                (*r).set_top((*r).end());
            }
            self.mutator_free_bitmap.set(i, false);
        }

        if beg == self.mutator_leftmost || end == self.mutator_rightmost {
            self.adjust_mutator_bounds();
        }

        self.increase_used(region_size * num);
        self.heap().increase_used(region_size * num);
        req.set_actual_size(size);

        if remainder != 0 {
            // The tail of the last region is dead space until the object dies.
            heap.notify_mutator_alloc(region_size - remainder, true);
        }

        unsafe { (*heap.get_region(beg)).bottom() as *mut u8 }
    }

    /// Recycles every trash region, taking the heap lock per region so
    /// mutators are never blocked behind the full sweep.
    pub fn recycle_trash(&mut self) {
        for i in 0..self.heap().num_regions() {
            let r = self.heap().get_region(i);
            unsafe {
                if (*r).is_trash() {
                    self.heap().lock();
                    self.try_recycle_trashed(r);
                    self.heap().unlock();
                }
            }
        }
    }

    /// Largest free chunk visible to TLAB sizing. Deliberately unlocked;
    /// callers tolerate stale answers.
    pub unsafe fn unsafe_peek_free(&self) -> usize {
        for idx in self.mutator_leftmost..=self.mutator_rightmost.min(self.max.saturating_sub(1)) {
            if self.is_mutator_free(idx) {
                let r = self.heap().get_region(idx);
                let free = self.alloc_capacity(r);
                if free >= self.heap().options().min_tlab_size {
                    return free;
                }
            }
        }
        0
    }

    /// The partition invariant: every region index is set in at most one of
    /// the two views, and the cached bounds bracket every set bit.
    #[cfg(test)]
    pub fn assert_partitioned(&self) {
        for i in 0..self.max {
            assert!(
                !(self.mutator_free_bitmap.get(i) && self.collector_free_bitmap.get(i)),
                "region {} in both free-set views",
                i
            );
            if self.mutator_free_bitmap.get(i) {
                assert!(
                    i >= self.mutator_leftmost && i <= self.mutator_rightmost,
                    "mutator bit {} outside bounds [{}, {}]",
                    i,
                    self.mutator_leftmost,
                    self.mutator_rightmost
                );
            }
            if self.collector_free_bitmap.get(i) {
                assert!(
                    i >= self.collector_leftmost && i <= self.collector_rightmost,
                    "collector bit {} outside bounds [{}, {}]",
                    i,
                    self.collector_leftmost,
                    self.collector_rightmost
                );
            }
        }
    }

    pub fn log_status(&self) {
        if log::log_enabled!(target: "gc", log::Level::Debug) {
            let mut total_free = 0;
            let mut max_free = 0;
            for idx in 0..self.max {
                if self.is_mutator_free(idx) || self.is_collector_free(idx) {
                    let free = self.alloc_capacity(self.heap().get_region(idx));
                    total_free += free;
                    max_free = max_free.max(free);
                }
            }
            log::debug!(
                target: "gc",
                "Free: {} ({} mutator / {} collector regions), Max regular: {}",
                formatted_size(total_free),
                self.mutator_count(),
                self.collector_count(),
                formatted_size(max_free),
            );
        }
    }
}
