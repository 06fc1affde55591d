use crate::heap::collection_set::CollectionSet;
use crate::heap::heap::Heap;
use crate::heap::region::HeapOptions;

use super::{default_choose_collection_set, Heuristics, HeuristicsBase};

/// Stress policy: every control-loop iteration triggers a cycle and any
/// region with a single garbage byte is evacuated. Useless in production,
/// invaluable for shaking races out of the concurrent machinery.
pub struct AggressiveHeuristics {
    base: HeuristicsBase,
}

impl AggressiveHeuristics {
    pub fn new(opts: &HeapOptions) -> Box<dyn Heuristics> {
        Box::new(Self {
            base: HeuristicsBase::new(opts),
        })
    }
}

impl Heuristics for AggressiveHeuristics {
    fn base(&self) -> &HeuristicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HeuristicsBase {
        &mut self.base
    }

    fn name(&self) -> &'static str {
        "aggressive"
    }

    fn should_start_concurrent_mark(&mut self, _used: usize, _capacity: usize) -> bool {
        log::info!(target: "gc", "Trigger: Aggressive policy starts unconditionally");
        true
    }

    fn choose_collection_set(&mut self, heap: &Heap, cset: &mut CollectionSet) {
        // Zero threshold: evacuate everything that has any garbage at all.
        default_choose_collection_set(heap, cset, 0, None);
    }

    fn should_process_references(&self) -> bool {
        true
    }

    fn should_unload_classes(&self) -> bool {
        true
    }
}
