use std::ptr::null_mut;
use std::time::{Duration, Instant};

use crate::utils::{formatted_size, formatted_sizef};
use crate::utils::number_seq::TruncatedSeq;

use crate::heap::collection_set::CollectionSet;
use crate::heap::heap::Heap;
use crate::heap::region::HeapOptions;

use super::{Heuristics, HeuristicsBase};

/// Which trigger fired last; successful and failed cycle outcomes adjust the
/// corresponding sensitivity knob.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Trigger {
    Spike,
    Rate,
    Other,
}

// Sensitivity adjustments after bad cycles, in standard deviations.
pub const FULL_PENALTY_SD: f64 = 0.2;
pub const DEGENERATE_PENALTY_SD: f64 = 0.1;

// Bounds on how far the adaptive knobs may drift. Empirical tunables, not
// load-bearing precise values.
pub const MINIMUM_CONFIDENCE: f64 = 0.319;
pub const MAXIMUM_CONFIDENCE: f64 = 3.291;

// Cycle outcomes with available memory inside this z-score band make no
// adjustment at all.
pub const LOWEST_EXPECTED_AVAILABLE_AT_END: f64 = -0.5;
pub const HIGHEST_EXPECTED_AVAILABLE_AT_END: f64 = 0.5;

/// Headroom multiplier for the dynamic policy. Tunable.
pub const DYNAMIC_HEADROOM_WIGGLE: f64 = 1.3;

fn saturate(value: f64, min: f64, max: f64) -> f64 {
    value.min(max).max(min)
}

/// Windowed allocation-rate estimator fed from the heap's
/// allocated-since-cycle-start counter.
struct AllocationRate {
    last_sample_time: Instant,
    last_sample_value: usize,
    interval: Duration,
    rate: TruncatedSeq,
    rate_avg: TruncatedSeq,
}

impl AllocationRate {
    fn new(opts: &HeapOptions) -> Self {
        let samples = opts.adaptive_sample_size_seconds * opts.adaptive_sample_frequency_hz;
        Self {
            last_sample_time: Instant::now(),
            last_sample_value: 0,
            interval: Duration::from_millis(
                (1000.0 / opts.adaptive_sample_frequency_hz as f64) as u64,
            ),
            rate: TruncatedSeq::new(samples, opts.adaptive_decay_factor),
            rate_avg: TruncatedSeq::new(samples, opts.adaptive_decay_factor),
        }
    }

    fn sample(&mut self, allocated: usize) -> f64 {
        let now = Instant::now();
        let mut rate = 0.0;

        if now - self.last_sample_time > self.interval {
            if allocated >= self.last_sample_value {
                rate = self.instantaneous_rate(now, allocated);
                self.rate.add(rate);
                self.rate_avg.add(self.rate.avg());
            }
            self.last_sample_time = now;
            self.last_sample_value = allocated;
        }

        rate
    }

    fn instantaneous_rate(&self, time: Instant, allocated: usize) -> f64 {
        let allocation_delta = allocated.saturating_sub(self.last_sample_value);
        let time_delta_sec = (time - self.last_sample_time).as_secs_f64();
        if time_delta_sec > 0.0 {
            allocation_delta as f64 / time_delta_sec
        } else {
            0.0
        }
    }

    fn upper_bound(&self, sds: f64) -> f64 {
        // Standard deviation of the moving average, not of the raw samples:
        // a much more stable bound, and the statistic actually in use.
        self.rate.davg() + sds * self.rate_avg.dsd()
    }

    fn is_spiking(&self, rate: f64, threshold: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        let sd = self.rate.sd();
        if sd > 0.0 {
            let z_score = (rate - self.rate.avg()) / sd;
            if z_score > threshold {
                return true;
            }
        }
        false
    }

    fn reset(&mut self) {
        self.last_sample_time = Instant::now();
        self.last_sample_value = 0;
    }
}

/// Rate-learning trigger: starts a cycle when the average GC duration no
/// longer fits into the time the observed allocation rate needs to eat the
/// remaining headroom. The `newadaptive` variant additionally watches for
/// allocation spikes.
pub struct AdaptiveHeuristics {
    base: HeuristicsBase,
    heap: *mut Heap,
    allocation_rate: AllocationRate,

    /// Margin of error (in standard deviations) added to the rate and cycle
    /// time estimates. Raising it triggers more, earlier.
    margin_of_error_sd: f64,

    /// Allocation spike sensitivity (in standard deviations); only consulted
    /// by the spike-detecting variant.
    spike_threshold_sd: f64,

    detect_spikes: bool,
    available: TruncatedSeq,
    last_trigger: Trigger,

    min_free_threshold: usize,
    init_free_threshold: usize,
    learning_steps: usize,
    alloc_spike_factor: usize,
}

impl AdaptiveHeuristics {
    pub fn new(opts: &HeapOptions, detect_spikes: bool) -> Box<dyn Heuristics> {
        Box::new(Self {
            base: HeuristicsBase::new(opts),
            heap: null_mut(),
            allocation_rate: AllocationRate::new(opts),
            margin_of_error_sd: opts.adaptive_initial_confidence,
            spike_threshold_sd: opts.adaptive_initial_spike_threshold,
            detect_spikes,
            available: TruncatedSeq::new(10, 0.3),
            last_trigger: Trigger::Other,
            min_free_threshold: opts.min_free_threshold,
            init_free_threshold: opts.init_free_threshold,
            learning_steps: opts.learning_steps,
            alloc_spike_factor: opts.alloc_spike_factor,
        })
    }

    fn heap(&self) -> Option<&Heap> {
        if self.heap.is_null() {
            None
        } else {
            Some(unsafe { &*self.heap })
        }
    }

    fn adjust_margin_of_error(&mut self, amount: f64) {
        self.margin_of_error_sd = saturate(
            self.margin_of_error_sd + amount,
            MINIMUM_CONFIDENCE,
            MAXIMUM_CONFIDENCE,
        );
    }

    fn adjust_spike_threshold(&mut self, amount: f64) {
        self.spike_threshold_sd = saturate(
            self.spike_threshold_sd + amount,
            MINIMUM_CONFIDENCE,
            MAXIMUM_CONFIDENCE,
        );
    }

    fn adjust_last_trigger_parameters(&mut self, amount: f64) {
        match self.last_trigger {
            Trigger::Rate => self.adjust_margin_of_error(amount),
            Trigger::Spike => self.adjust_spike_threshold(amount),
            Trigger::Other => (),
        }
    }
}

// The back-reference is only dereferenced by the control thread.
unsafe impl Send for AdaptiveHeuristics {}

impl Heuristics for AdaptiveHeuristics {
    fn base(&self) -> &HeuristicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HeuristicsBase {
        &mut self.base
    }

    fn name(&self) -> &'static str {
        if self.detect_spikes {
            "newadaptive"
        } else {
            "adaptive"
        }
    }

    fn set_heap(&mut self, heap: *mut Heap) {
        self.heap = heap;
    }

    fn should_start_concurrent_mark(&mut self, used: usize, capacity: usize) -> bool {
        let available = capacity.saturating_sub(used);
        let allocated = self
            .heap()
            .map(|h| h.bytes_allocated_since_gc_start())
            .unwrap_or(0);

        let rate = self.allocation_rate.sample(allocated);
        self.last_trigger = Trigger::Other;

        let min_threshold = capacity / 100 * self.min_free_threshold;
        if available < min_threshold {
            log::info!(
                target: "gc",
                "Trigger: Free ({}) is below minimum threshold ({})",
                formatted_size(available),
                formatted_size(min_threshold)
            );
            return true;
        }

        if self.base.gc_times_learned < self.learning_steps {
            let init_threshold = capacity / 100 * self.init_free_threshold;
            if available < init_threshold {
                log::info!(
                    target: "gc",
                    "Trigger: Learning {} of {}. Free ({}) is below initial threshold ({})",
                    self.base.gc_times_learned + 1,
                    self.learning_steps,
                    formatted_size(available),
                    formatted_size(init_threshold)
                );
                return true;
            }
        }

        // Remaining headroom, minus room kept for allocation spikes and the
        // penalties accumulated from degenerated/full cycles.
        let mut allocation_headroom = available;
        let spike_headroom = capacity / 100 * self.alloc_spike_factor;
        let penalties = capacity / 100 * self.base.gc_time_penalties as usize;
        allocation_headroom -= allocation_headroom.min(spike_headroom);
        allocation_headroom -= allocation_headroom.min(penalties);

        let avg_alloc_rate = self.allocation_rate.upper_bound(self.margin_of_error_sd);
        let avg_cycle_time = self.base.gc_time_history.davg()
            + self.margin_of_error_sd * self.base.gc_time_history.dsd();

        if avg_alloc_rate > 0.0 && avg_cycle_time > allocation_headroom as f64 / avg_alloc_rate {
            log::info!(
                target: "gc",
                "Trigger: Average GC time ({:.2} ms) is above the time for average allocation rate ({}B/s) to deplete free headroom ({}) (margin of error = {:.2})",
                avg_cycle_time * 1000.0,
                formatted_sizef(avg_alloc_rate),
                formatted_size(allocation_headroom),
                self.margin_of_error_sd
            );
            self.last_trigger = Trigger::Rate;
            return true;
        }

        if self.detect_spikes {
            let is_spiking = self.allocation_rate.is_spiking(rate, self.spike_threshold_sd);
            if is_spiking && rate > 0.0 && avg_cycle_time > allocation_headroom as f64 / rate {
                log::info!(
                    target: "gc",
                    "Trigger: Average GC time ({:.2} ms) is above the time for instantaneous allocation rate ({}B/s) to deplete free headroom ({}) (spike threshold = {:.2})",
                    avg_cycle_time * 1000.0,
                    formatted_sizef(rate),
                    formatted_size(allocation_headroom),
                    self.spike_threshold_sd
                );
                self.last_trigger = Trigger::Spike;
                return true;
            }
        }

        self.base.check_guaranteed_interval()
    }

    fn record_cycle_start(&mut self) {
        self.base.cycle_start = Instant::now();
        self.allocation_rate.reset();
    }

    fn record_success_concurrent(&mut self) {
        let t = self.time_since_last_gc().as_micros() as f64 / 1_000_000.0;
        self.base.degenerated_cycles_in_a_row = 0;
        self.base.successful_cycles_in_a_row += 1;
        self.base.gc_time_history.add(t);
        self.base.gc_times_learned += 1;
        self.adjust_penalty(super::CONCURRENT_ADJUST);

        let available = self
            .heap()
            .map(|h| h.free_set().available())
            .unwrap_or(0);
        self.available.add(available as f64);

        let mut z_score = 0.0;
        if self.available.sd() > 0.0 {
            z_score = (available as f64 - self.available.avg()) / self.available.sd();
        }

        // A cycle that ended with unusually little memory available makes
        // the triggers more sensitive; an unusually comfortable one relaxes
        // them. Inside the expected band nothing changes, which keeps the
        // knobs still once the application stabilizes.
        if z_score < LOWEST_EXPECTED_AVAILABLE_AT_END
            || z_score > HIGHEST_EXPECTED_AVAILABLE_AT_END
        {
            // Sign flipped: below-average availability must tighten, not
            // loosen. The divisor attenuates per-cycle adjustments to an
            // order of magnitude below the degenerated/full penalties.
            self.adjust_last_trigger_parameters(z_score / -100.0);
        }
    }

    fn record_success_degenerated(&mut self) {
        self.base.degenerated_cycles_in_a_row += 1;
        self.base.successful_cycles_in_a_row = 0;
        self.adjust_penalty(super::DEGENERATED_PENALTY);
        self.adjust_margin_of_error(DEGENERATE_PENALTY_SD);
        self.adjust_spike_threshold(DEGENERATE_PENALTY_SD);
    }

    fn record_success_full(&mut self) {
        self.base.degenerated_cycles_in_a_row = 0;
        self.base.successful_cycles_in_a_row += 1;
        self.adjust_penalty(super::FULL_PENALTY);
        self.adjust_margin_of_error(FULL_PENALTY_SD);
        self.adjust_spike_threshold(FULL_PENALTY_SD);
    }
}

/// Simpler rate-derived policy: keep enough headroom for one average cycle
/// at the decaying-average allocation rate, padded by a fixed wiggle factor.
/// Its collection sets aim for a garbage target instead of taking everything
/// over the per-region threshold.
pub struct DynamicHeuristics {
    base: HeuristicsBase,
    heap: *mut Heap,
    allocation_rate: AllocationRate,
    min_free_threshold: usize,
}

impl DynamicHeuristics {
    pub fn new(opts: &HeapOptions) -> Box<dyn Heuristics> {
        Box::new(Self {
            base: HeuristicsBase::new(opts),
            heap: null_mut(),
            allocation_rate: AllocationRate::new(opts),
            min_free_threshold: opts.min_free_threshold,
        })
    }
}

unsafe impl Send for DynamicHeuristics {}

impl Heuristics for DynamicHeuristics {
    fn base(&self) -> &HeuristicsBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HeuristicsBase {
        &mut self.base
    }

    fn name(&self) -> &'static str {
        "dynamic"
    }

    fn set_heap(&mut self, heap: *mut Heap) {
        self.heap = heap;
    }

    fn should_start_concurrent_mark(&mut self, used: usize, capacity: usize) -> bool {
        let available = capacity.saturating_sub(used);
        let allocated = if self.heap.is_null() {
            0
        } else {
            unsafe { (*self.heap).bytes_allocated_since_gc_start() }
        };

        self.allocation_rate.sample(allocated);

        let min_free = capacity / 100 * self.min_free_threshold;
        let avg_cycle_time = self.base.gc_time_history.davg();
        let needed =
            (self.allocation_rate.rate.davg() * avg_cycle_time * DYNAMIC_HEADROOM_WIGGLE) as usize;

        if available < min_free + needed {
            log::info!(
                target: "gc",
                "Trigger: Free ({}) is below dynamic headroom ({} floor + {} rate demand)",
                formatted_size(available),
                formatted_size(min_free),
                formatted_size(needed)
            );
            return true;
        }

        self.base.check_guaranteed_interval()
    }

    fn choose_collection_set(&mut self, heap: &Heap, cset: &mut CollectionSet) {
        let threshold =
            heap.options().region_size_bytes * heap.options().garbage_threshold / 100;
        // Reclaim at least what the mutators dirtied since the cycle
        // started, with a floor to make slow phases still productive.
        let target = heap
            .bytes_allocated_since_gc_start()
            .max(heap.max_capacity() / 10);
        super::default_choose_collection_set(heap, cset, threshold, Some(target));
    }

    fn record_cycle_start(&mut self) {
        self.base.cycle_start = Instant::now();
        self.allocation_rate.reset();
    }
}
