use std::time::{Duration, Instant};

use crate::utils::formatted_size;
use crate::utils::number_seq::TruncatedSeq;

use super::collection_set::CollectionSet;
use super::heap::Heap;
use super::region::HeapOptions;
use super::GCHeuristic;

pub mod adaptive;
pub mod aggressive;
pub mod static_;

pub const CONCURRENT_ADJUST: isize = -1; // recover from penalties
pub const DEGENERATED_PENALTY: isize = 10; // average-duration penalty on Degenerated GC
pub const FULL_PENALTY: isize = 20; // average-duration penalty on Full GC

/// Bookkeeping shared by every policy: cycle outcomes, learned GC times and
/// the penalty accumulator that biases triggers after bad cycles.
pub struct HeuristicsBase {
    pub degenerated_cycles_in_a_row: usize,
    pub successful_cycles_in_a_row: usize,
    pub cycle_start: Instant,
    pub last_cycle_end: Instant,
    pub gc_times_learned: usize,
    pub gc_time_penalties: isize,
    pub gc_time_history: TruncatedSeq,
    pub guaranteed_gc_interval: usize,
}

impl HeuristicsBase {
    pub fn new(opts: &HeapOptions) -> Self {
        Self {
            degenerated_cycles_in_a_row: 0,
            successful_cycles_in_a_row: 0,
            cycle_start: Instant::now(),
            last_cycle_end: Instant::now(),
            gc_times_learned: 0,
            gc_time_penalties: 0,
            gc_time_history: TruncatedSeq::new(10, opts.adaptive_decay_factor),
            guaranteed_gc_interval: opts.guaranteed_gc_interval,
        }
    }

    pub fn check_guaranteed_interval(&self) -> bool {
        if self.guaranteed_gc_interval > 0 {
            let last_time_ms = self.last_cycle_end.elapsed().as_millis();
            if last_time_ms > self.guaranteed_gc_interval as u128 {
                log::info!(
                    target: "gc",
                    "Trigger: Time since last GC ({} ms) is larger than guaranteed interval ({} ms)",
                    last_time_ms,
                    self.guaranteed_gc_interval
                );
                return true;
            }
        }
        false
    }
}

/// A collection policy: when to start a concurrent cycle, which regions to
/// evacuate, and how to repartition the free set afterwards. Cycle-outcome
/// bookkeeping has shared defaults; policies override the trigger and,
/// rarely, the selection.
pub trait Heuristics: Send {
    fn base(&self) -> &HeuristicsBase;
    fn base_mut(&mut self) -> &mut HeuristicsBase;
    fn name(&self) -> &'static str;

    /// Policies that sample heap counters get the back-reference here.
    fn set_heap(&mut self, _heap: *mut Heap) {}

    fn should_start_concurrent_mark(&mut self, used: usize, capacity: usize) -> bool;

    /// Default greedy selection: regions sorted by garbage, richest first.
    fn choose_collection_set(&mut self, heap: &Heap, cset: &mut CollectionSet) {
        let threshold =
            heap.options().region_size_bytes * heap.options().garbage_threshold / 100;
        default_choose_collection_set(heap, cset, threshold, None);
    }

    /// After selection, everything that is not in the cset and not humongous
    /// goes back to the free set.
    fn choose_free_set(&self, heap: &Heap) {
        heap.rebuild_free_set();
    }

    fn should_process_references(&self) -> bool {
        true
    }

    fn should_unload_classes(&self) -> bool {
        false
    }

    /// Skip the dedicated update-refs phase and let the next cycle's marking
    /// rewrite stale references as it scans.
    fn should_coalesce_update_refs(&self) -> bool {
        false
    }

    fn should_degenerate_cycle(&self, full_gc_threshold: usize) -> bool {
        self.base().degenerated_cycles_in_a_row <= full_gc_threshold
    }

    fn record_cycle_start(&mut self) {
        self.base_mut().cycle_start = Instant::now();
    }

    fn record_cycle_end(&mut self) {
        self.base_mut().last_cycle_end = Instant::now();
    }

    fn time_since_last_gc(&self) -> Duration {
        self.base().cycle_start.elapsed()
    }

    fn record_success_concurrent(&mut self) {
        let t = self.time_since_last_gc().as_micros() as f64 / 1_000_000.0;
        let base = self.base_mut();
        base.degenerated_cycles_in_a_row = 0;
        base.successful_cycles_in_a_row += 1;
        base.gc_time_history.add(t);
        base.gc_times_learned += 1;
        self.adjust_penalty(CONCURRENT_ADJUST);
    }

    fn record_success_degenerated(&mut self) {
        let base = self.base_mut();
        base.degenerated_cycles_in_a_row += 1;
        base.successful_cycles_in_a_row = 0;
        self.adjust_penalty(DEGENERATED_PENALTY);
    }

    fn record_success_full(&mut self) {
        let base = self.base_mut();
        base.degenerated_cycles_in_a_row = 0;
        base.successful_cycles_in_a_row += 1;
        self.adjust_penalty(FULL_PENALTY);
    }

    fn record_allocation_failure_gc(&mut self) {}

    /// Explicit collections usually mean external state changed; relearn.
    fn record_requested_gc(&mut self) {
        self.base_mut().gc_times_learned = 0;
    }

    fn adjust_penalty(&mut self, step: isize) {
        let base = self.base_mut();
        base.gc_time_penalties = (base.gc_time_penalties + step).clamp(0, 100);
    }
}

/// Shared selection algorithm. Walks all regions once: humongous and regular
/// regions with no live data are reclaimed on the spot ("immediate
/// garbage"); the rest are sorted by garbage, descending, and added while
/// their garbage exceeds `garbage_threshold` bytes. With `min_garbage` set,
/// selection additionally stops once the set holds that much reclaimable
/// garbage.
pub fn default_choose_collection_set(
    heap: &Heap,
    cset: &mut CollectionSet,
    garbage_threshold: usize,
    min_garbage: Option<usize>,
) {
    let mut candidates: Vec<(usize, usize, usize)> = Vec::new();
    let mut immediate_garbage = 0usize;
    let mut immediate_regions = 0usize;

    for i in 0..heap.num_regions() {
        let region = heap.get_region(i);
        unsafe {
            if (*region).is_humongous_start() {
                if (*region).live_data() == 0 {
                    immediate_garbage += (*region).garbage();
                    immediate_regions += heap.trash_humongous_region_at(region);
                }
                continue;
            }
            if !(*region).is_regular() {
                // Continuations are accounted by their start region; pinned
                // and empty regions are never candidates.
                continue;
            }
            if (*region).live_data() == 0 {
                // Fully dead: reclaim without copying a single byte.
                immediate_garbage += (*region).garbage();
                immediate_regions += 1;
                (*region)
                    .make_trash()
                    .expect("regular region can always be trashed");
                continue;
            }
            candidates.push(((*region).index(), (*region).garbage(), (*region).live_data()));
        }
    }

    // Stable: ties keep ascending scan order.
    candidates.sort_by(|a, b| b.1.cmp(&a.1));

    for (index, garbage, live) in candidates {
        if garbage <= garbage_threshold {
            break;
        }
        if let Some(target) = min_garbage {
            if cset.garbage() >= target {
                break;
            }
        }
        unsafe {
            (*heap.get_region(index))
                .make_cset()
                .expect("candidate region must accept cset state");
        }
        cset.add_region(index, garbage, live);
    }

    log::info!(
        target: "gc",
        "Collection set: {} regions ({} garbage, {} live), immediate: {} regions ({})",
        cset.count(),
        formatted_size(cset.garbage()),
        formatted_size(cset.live()),
        immediate_regions,
        formatted_size(immediate_garbage),
    );
}

pub fn new_heuristics(opts: &HeapOptions) -> Box<dyn Heuristics> {
    match opts.heuristics {
        GCHeuristic::Aggressive => aggressive::AggressiveHeuristics::new(opts),
        GCHeuristic::StatusQuo => static_::StaticThresholdHeuristics::statusquo(opts),
        GCHeuristic::Halfway => static_::StaticThresholdHeuristics::halfway(opts),
        GCHeuristic::Lazy => static_::StaticThresholdHeuristics::lazy(opts),
        GCHeuristic::Dynamic => adaptive::DynamicHeuristics::new(opts),
        GCHeuristic::Adaptive => adaptive::AdaptiveHeuristics::new(opts, false),
        GCHeuristic::NewAdaptive => adaptive::AdaptiveHeuristics::new(opts, true),
    }
}
