use crate::utils::formatted_size;

use crate::heap::region::HeapOptions;

use super::{Heuristics, HeuristicsBase};

/// The fixed-fraction trigger family. A cycle starts once used space climbs
/// past `num/den` of capacity; nothing is learned or adapted. `lazy` also
/// coalesces update-refs into the next cycle's mark, trading one pause for a
/// longer mark.
pub struct StaticThresholdHeuristics {
    base: HeuristicsBase,
    name: &'static str,
    num: usize,
    den: usize,
    coalesce_update_refs: bool,
}

impl StaticThresholdHeuristics {
    fn with_fraction(
        opts: &HeapOptions,
        name: &'static str,
        num: usize,
        den: usize,
        coalesce_update_refs: bool,
    ) -> Box<dyn Heuristics> {
        Box::new(Self {
            base: HeuristicsBase::new(opts),
            name,
            num,
            den,
            coalesce_update_refs,
        })
    }

    pub fn statusquo(opts: &HeapOptions) -> Box<dyn Heuristics> {
        Self::with_fraction(opts, "statusquo", 1, 3, false)
    }

    pub fn halfway(opts: &HeapOptions) -> Box<dyn Heuristics> {
        Self::with_fraction(opts, "halfway", 1, 2, false)
    }

    pub fn lazy(opts: &HeapOptions) -> Box<dyn Heuristics> {
        Self::with_fraction(opts, "lazy", 4, 5, true)
    }
}

impl Heuristics for StaticThresholdHeuristics {
    fn base(&self) -> &HeuristicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HeuristicsBase {
        &mut self.base
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn should_start_concurrent_mark(&mut self, used: usize, capacity: usize) -> bool {
        // used/capacity > num/den, in integers.
        if used * self.den > capacity * self.num {
            log::info!(
                target: "gc",
                "Trigger: Used ({}) is above {}/{} of capacity ({})",
                formatted_size(used),
                self.num,
                self.den,
                formatted_size(capacity)
            );
            return true;
        }

        self.base.check_guaranteed_interval()
    }

    fn should_coalesce_update_refs(&self) -> bool {
        self.coalesce_update_refs
    }
}

#[cfg(test)]
mod tests {
    use crate::heap::heuristics::Heuristics as _;
    use crate::heap::region::{HeapArguments, HeapRegion};

    use super::StaticThresholdHeuristics;

    #[test]
    fn lazy_threshold_boundary() {
        let opts = HeapRegion::setup_sizes(&HeapArguments::default());
        let mut lazy = StaticThresholdHeuristics::lazy(&opts);

        // 4/5 of 1000 is the watershed; exactly at the threshold stays idle.
        assert!(!lazy.should_start_concurrent_mark(799, 1000));
        assert!(!lazy.should_start_concurrent_mark(800, 1000));
        assert!(lazy.should_start_concurrent_mark(801, 1000));
    }

    #[test]
    fn halfway_threshold() {
        let opts = HeapRegion::setup_sizes(&HeapArguments::default());
        let mut halfway = StaticThresholdHeuristics::halfway(&opts);
        assert!(!halfway.should_start_concurrent_mark(500, 1000));
        assert!(halfway.should_start_concurrent_mark(501, 1000));
    }
}
