use core::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

use crate::utils::formatted_size;

use super::{align_down, align_usize, virtual_memory, AllocType, GCHeuristic};

/// Region life-cycle states.
///
/// Humongous objects span one `HumongousStart` region followed by zero or
/// more `HumongousCont` regions; they never move and never enter the
/// collection set. `Pinned` regions are likewise exempt from evacuation.
/// `Trash` regions hold only garbage and are recycled in bulk.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum RegionState {
    EmptyUncommitted,
    EmptyCommitted,
    Regular,
    HumongousStart,
    HumongousCont,
    Cset,
    Pinned,
    Trash,
}

/// A rejected region state transition. GC code treats this as a programming
/// error; surfacing it as a value keeps the legality check in exactly one
/// place instead of scattered asserts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RegionStateError {
    pub from: RegionState,
    pub to: RegionState,
}

impl fmt::Display for RegionStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "illegal region state transition {:?} -> {:?}",
            self.from, self.to
        )
    }
}

/// Header for one fixed-size slice of the heap. Stored in a side table, never
/// inside the region's own memory.
pub struct HeapRegion {
    state: RegionState,
    index: usize,
    bottom: usize,
    end: usize,
    top: usize,

    live_data: AtomicUsize,
    pins: AtomicU32,

    tlab_allocs: usize,
    gclab_allocs: usize,
    shared_allocs: usize,

    empty_time: Instant,
}

impl HeapRegion {
    pub fn new(index: usize, bottom: usize, opts: &HeapOptions, committed: bool) -> Self {
        Self {
            state: if committed {
                RegionState::EmptyCommitted
            } else {
                RegionState::EmptyUncommitted
            },
            index,
            bottom,
            end: bottom + opts.region_size_bytes,
            top: bottom,
            live_data: AtomicUsize::new(0),
            pins: AtomicU32::new(0),
            tlab_allocs: 0,
            gclab_allocs: 0,
            shared_allocs: 0,
            empty_time: Instant::now(),
        }
    }

    /// The only place that mutates `state`.
    fn transition(&mut self, to: RegionState) -> Result<(), RegionStateError> {
        use RegionState::*;
        let legal = match (self.state, to) {
            (EmptyUncommitted, EmptyCommitted) => true,
            (EmptyCommitted, Regular)
            | (EmptyCommitted, HumongousStart)
            | (EmptyCommitted, HumongousCont)
            | (EmptyCommitted, EmptyUncommitted) => true,
            (Regular, Cset) | (Regular, Trash) | (Regular, Pinned) => true,
            (Pinned, Regular) => true,
            // Cset -> Regular is the full-GC reset of an interrupted cycle.
            (Cset, Trash) | (Cset, Regular) => true,
            (HumongousStart, Trash) | (HumongousCont, Trash) => true,
            (Trash, EmptyCommitted) => true,
            _ => false,
        };
        if legal {
            self.state = to;
            Ok(())
        } else {
            Err(RegionStateError {
                from: self.state,
                to,
            })
        }
    }

    pub fn make_regular_allocation(&mut self) -> Result<(), RegionStateError> {
        self.transition(RegionState::Regular)
    }

    pub fn make_humongous_start(&mut self) -> Result<(), RegionStateError> {
        self.transition(RegionState::HumongousStart)
    }

    pub fn make_humongous_cont(&mut self) -> Result<(), RegionStateError> {
        self.transition(RegionState::HumongousCont)
    }

    pub fn make_cset(&mut self) -> Result<(), RegionStateError> {
        debug_assert_eq!(self.pin_count(), 0, "pinned regions never enter the cset");
        self.transition(RegionState::Cset)
    }

    pub fn make_trash(&mut self) -> Result<(), RegionStateError> {
        self.transition(RegionState::Trash)
    }

    pub fn make_empty_committed(&mut self) -> Result<(), RegionStateError> {
        self.transition(RegionState::EmptyCommitted)
    }

    pub fn make_empty_uncommitted(&mut self) -> Result<(), RegionStateError> {
        self.transition(RegionState::EmptyUncommitted)
    }

    /// Returns a trash region to the empty pool: state, allocation cursor and
    /// liveness all reset.
    pub fn recycle(&mut self) {
        self.transition(RegionState::EmptyCommitted)
            .expect("only trash regions are recycled");
        self.top = self.bottom;
        self.live_data.store(0, Ordering::Relaxed);
        self.tlab_allocs = 0;
        self.gclab_allocs = 0;
        self.shared_allocs = 0;
        self.empty_time = Instant::now();
    }

    /// Nested, thread-safe pinning. The first pin moves a regular region to
    /// `Pinned`; the last unpin moves it back.
    pub fn pin(&mut self) -> Result<(), RegionStateError> {
        if self.pins.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Err(e) = self.transition(RegionState::Pinned) {
                self.pins.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn unpin(&mut self) -> Result<(), RegionStateError> {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unbalanced unpin on region {}", self.index);
        if prev == 1 {
            self.transition(RegionState::Regular)?;
        }
        Ok(())
    }

    pub fn pin_count(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    /// Bump allocation. Returns null when the remaining space cannot satisfy
    /// the request; the free set then retires this region.
    pub fn allocate(&mut self, size: usize, typ: AllocType) -> *mut u8 {
        debug_assert!(super::is_aligned(size, crate::object::OBJECT_ALIGNMENT));
        if self.end - self.top < size {
            return std::ptr::null_mut();
        }
        let result = self.top;
        self.top += size;
        match typ {
            AllocType::Tlab => self.tlab_allocs += size,
            AllocType::Gclab => self.gclab_allocs += size,
            AllocType::Shared | AllocType::SharedGc => self.shared_allocs += size,
        }
        result as *mut u8
    }

    pub fn state(&self) -> RegionState {
        self.state
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bottom(&self) -> usize {
        self.bottom
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn top(&self) -> usize {
        self.top
    }

    pub(crate) fn set_top(&mut self, top: usize) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top = top;
    }

    pub fn size(&self) -> usize {
        self.end - self.bottom
    }

    pub fn used(&self) -> usize {
        self.top - self.bottom
    }

    pub fn free(&self) -> usize {
        self.end - self.top
    }

    pub fn live_data(&self) -> usize {
        self.live_data.load(Ordering::Acquire)
    }

    /// Lock-free accumulation target for per-worker liveness buffers.
    pub fn increase_live_data(&self, bytes: usize) {
        self.live_data.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn set_live_data(&self, bytes: usize) {
        self.live_data.store(bytes, Ordering::Release);
    }

    pub fn clear_live_data(&self) {
        self.live_data.store(0, Ordering::Release);
    }

    /// Reclaimable bytes. Live data never exceeds used data outside an active
    /// marking phase; a violation is a counting bug.
    ///
    /// A humongous start region carries the liveness of the whole run, so its
    /// garbage is all-or-nothing: the run is reclaimable exactly when the
    /// object is dead. Continuation regions delegate to their start region.
    pub fn garbage(&self) -> usize {
        let used = self.used();
        let live = self.live_data();
        if self.is_humongous_start() {
            return if live == 0 { used } else { 0 };
        }
        assert!(
            live <= used,
            "region {}: live {} exceeds used {}",
            self.index,
            live,
            used
        );
        used - live
    }

    pub fn empty_time(&self) -> Instant {
        self.empty_time
    }

    pub fn tlab_allocs(&self) -> usize {
        self.tlab_allocs
    }

    pub fn gclab_allocs(&self) -> usize {
        self.gclab_allocs
    }

    pub fn shared_allocs(&self) -> usize {
        self.shared_allocs
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom && addr < self.end
    }

    pub fn is_empty(&self) -> bool {
        matches!(
            self.state,
            RegionState::EmptyUncommitted | RegionState::EmptyCommitted
        )
    }

    pub fn is_committed(&self) -> bool {
        self.state != RegionState::EmptyUncommitted
    }

    pub fn is_regular(&self) -> bool {
        self.state == RegionState::Regular
    }

    pub fn is_humongous_start(&self) -> bool {
        self.state == RegionState::HumongousStart
    }

    pub fn is_humongous_cont(&self) -> bool {
        self.state == RegionState::HumongousCont
    }

    pub fn is_humongous(&self) -> bool {
        self.is_humongous_start() || self.is_humongous_cont()
    }

    pub fn is_cset(&self) -> bool {
        self.state == RegionState::Cset
    }

    pub fn is_pinned(&self) -> bool {
        self.state == RegionState::Pinned
    }

    pub fn is_trash(&self) -> bool {
        self.state == RegionState::Trash
    }

    /// Whether the free set may hand allocations out of this region.
    pub fn is_alloc_allowed(&self) -> bool {
        self.is_empty() || self.is_regular()
    }

    /// Regions that currently hold objects.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            RegionState::Regular
                | RegionState::HumongousStart
                | RegionState::HumongousCont
                | RegionState::Cset
                | RegionState::Pinned
        )
    }
}

/// Startup configuration, before validation and derivation.
pub struct HeapArguments {
    pub heuristics: GCHeuristic,
    pub max_heap_size: usize,
    pub min_region_size: Option<usize>,
    pub max_region_size: Option<usize>,
    pub target_num_regions: Option<usize>,
    pub region_size: Option<usize>,
    /// Percent of a region an object may fill before it is treated as
    /// humongous and gets contiguous whole regions of its own.
    pub humongous_threshold: Option<usize>,
    pub min_tlab_size: usize,
    pub elastic_tlab: bool,
    pub parallel_gc_threads: Option<usize>,
    pub concurrent_gc_threads: Option<usize>,
    pub garbage_threshold: usize,
    pub min_free_threshold: usize,
    pub init_free_threshold: usize,
    pub allocation_threshold: usize,
    pub alloc_spike_factor: usize,
    pub learning_steps: usize,
    pub evac_reserve: usize,
    pub allow_mixed_alloc: bool,
    pub degenerated_gc_enabled: bool,
    pub full_gc_threshold: usize,
    pub explicit_gc_concurrent: bool,
    pub always_full: bool,
    pub guaranteed_gc_interval: usize,
    pub control_interval_min: usize,
    pub control_interval_max: usize,
    pub control_interval_adjust_period: usize,
    pub uncommit: bool,
    pub uncommit_delay: usize,
    /// Tests drive collections synchronously and disable the service thread.
    pub start_control_thread: bool,
}

impl Default for HeapArguments {
    fn default() -> Self {
        Self {
            heuristics: GCHeuristic::Adaptive,
            max_heap_size: 256 * 1024 * 1024,
            min_region_size: None,
            max_region_size: None,
            target_num_regions: None,
            region_size: None,
            humongous_threshold: None,
            min_tlab_size: 2 * 1024,
            elastic_tlab: true,
            parallel_gc_threads: None,
            concurrent_gc_threads: None,
            garbage_threshold: 25,
            min_free_threshold: 10,
            init_free_threshold: 70,
            allocation_threshold: 10,
            alloc_spike_factor: 5,
            learning_steps: 5,
            evac_reserve: 5,
            allow_mixed_alloc: false,
            degenerated_gc_enabled: true,
            full_gc_threshold: 3,
            explicit_gc_concurrent: true,
            always_full: false,
            guaranteed_gc_interval: 5 * 60 * 1000,
            control_interval_min: 1,
            control_interval_max: 10,
            control_interval_adjust_period: 1000,
            uncommit: true,
            uncommit_delay: 5 * 60 * 1000,
            start_control_thread: true,
        }
    }
}

/// Validated, derived heap geometry and tunables. Computed once at startup
/// and immutable afterwards.
#[derive(Clone, Debug)]
pub struct HeapOptions {
    pub region_size_bytes: usize,
    pub region_size_words: usize,
    pub region_size_bytes_shift: usize,
    pub region_size_bytes_mask: usize,
    pub region_size_log2: usize,
    pub region_count: usize,
    pub humongous_threshold_words: usize,
    pub humongous_threshold_bytes: usize,
    pub max_heap_size: usize,
    pub min_tlab_size: usize,
    pub max_tlab_size: usize,
    pub elastic_tlab: bool,
    pub parallel_gc_threads: usize,
    pub concurrent_gc_threads: usize,
    pub parallel_region_stride: usize,
    pub garbage_threshold: usize,
    pub min_free_threshold: usize,
    pub init_free_threshold: usize,
    pub allocation_threshold: usize,
    pub alloc_spike_factor: usize,
    pub learning_steps: usize,
    pub evac_reserve: usize,
    pub allow_mixed_alloc: bool,
    pub degenerated_gc_enabled: bool,
    pub full_gc_threshold: usize,
    pub explicit_gc_concurrent: bool,
    pub always_full: bool,
    pub guaranteed_gc_interval: usize,
    pub control_interval_min: usize,
    pub control_interval_max: usize,
    pub control_interval_adjust_period: usize,
    pub uncommit: bool,
    pub uncommit_delay: usize,
    pub adaptive_sample_frequency_hz: usize,
    pub adaptive_sample_size_seconds: usize,
    pub adaptive_decay_factor: f64,
    pub adaptive_initial_confidence: f64,
    pub adaptive_initial_spike_threshold: f64,
    pub heuristics: GCHeuristic,
}

impl HeapOptions {
    /// Number of whole regions a humongous allocation of `size` bytes needs.
    pub const fn required_regions(&self, size: usize) -> usize {
        (size + self.region_size_bytes - 1) >> self.region_size_bytes_shift
    }
}

impl fmt::Display for HeapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapOptions")
            .field("max_heap_size", &formatted_size(self.max_heap_size))
            .field("region_count", &self.region_count)
            .field("region_size_bytes", &formatted_size(self.region_size_bytes))
            .field(
                "humongous_threshold_bytes",
                &formatted_size(self.humongous_threshold_bytes),
            )
            .field("max_tlab_size", &formatted_size(self.max_tlab_size))
            .finish()
    }
}

impl HeapRegion {
    pub const MIN_REGION_SIZE: usize = 4 * 1024;
    pub const MIN_NUM_REGIONS: usize = 10;
    pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;

    /// Derives region geometry and allocation thresholds from the startup
    /// arguments. Invalid configuration is fatal here, before any memory is
    /// reserved.
    pub fn setup_sizes(args: &HeapArguments) -> HeapOptions {
        let min_region_size = args
            .min_region_size
            .map(|x| x.max(Self::MIN_REGION_SIZE))
            .unwrap_or(Self::MIN_REGION_SIZE);
        let max_region_size = args.max_region_size.unwrap_or(Self::MAX_REGION_SIZE);
        let target_num_regions = args.target_num_regions.unwrap_or(128);
        let mut max_heap_size = args.max_heap_size;

        if min_region_size > max_heap_size / Self::MIN_NUM_REGIONS {
            panic!(
                "Max heap size ({}) is too low to afford the minimum number of regions ({}) of minimum region size ({})",
                formatted_size(max_heap_size),
                Self::MIN_NUM_REGIONS,
                formatted_size(min_region_size)
            );
        }

        let mut region_size = if let Some(region_size) = args.region_size {
            if region_size < min_region_size || region_size > max_region_size {
                panic!(
                    "Explicit region size ({}) is outside [{}, {}]",
                    formatted_size(region_size),
                    formatted_size(min_region_size),
                    formatted_size(max_region_size)
                );
            }
            region_size
        } else {
            (max_heap_size / target_num_regions)
                .max(min_region_size)
                .min(max_region_size)
        };

        region_size = align_usize(region_size, virtual_memory::page_size());
        let region_size_log = region_size.ilog2() as usize;
        region_size = 1 << region_size_log;
        max_heap_size = align_usize(max_heap_size, region_size);

        let humongous_threshold = args.humongous_threshold.unwrap_or(100);
        if humongous_threshold == 0 || humongous_threshold > 100 {
            panic!(
                "Humongous threshold must be within (0, 100]: {}",
                humongous_threshold
            );
        }

        let region_size_words = region_size / size_of::<usize>();
        let mut humongous_threshold_words = region_size_words * humongous_threshold / 100;
        humongous_threshold_words = align_down(humongous_threshold_words, 8);

        let parallel = args
            .parallel_gc_threads
            .unwrap_or_else(num_cpus::get)
            .max(1);
        let concurrent = args
            .concurrent_gc_threads
            .unwrap_or_else(|| (num_cpus::get() / 2).max(1))
            .max(1);

        let region_count = max_heap_size / region_size;

        let mut opts = HeapOptions {
            region_size_bytes: region_size,
            region_size_words,
            region_size_bytes_shift: region_size_log,
            region_size_bytes_mask: region_size - 1,
            region_size_log2: region_size_log,
            region_count,
            humongous_threshold_words,
            humongous_threshold_bytes: humongous_threshold_words * size_of::<usize>(),
            max_heap_size,
            min_tlab_size: args.min_tlab_size,
            max_tlab_size: 0,
            elastic_tlab: args.elastic_tlab,
            parallel_gc_threads: parallel,
            concurrent_gc_threads: concurrent,
            parallel_region_stride: 16,
            garbage_threshold: args.garbage_threshold,
            min_free_threshold: args.min_free_threshold,
            init_free_threshold: args.init_free_threshold,
            allocation_threshold: args.allocation_threshold,
            alloc_spike_factor: args.alloc_spike_factor,
            learning_steps: args.learning_steps,
            evac_reserve: args.evac_reserve,
            allow_mixed_alloc: args.allow_mixed_alloc,
            degenerated_gc_enabled: args.degenerated_gc_enabled,
            full_gc_threshold: args.full_gc_threshold,
            explicit_gc_concurrent: args.explicit_gc_concurrent,
            always_full: args.always_full,
            guaranteed_gc_interval: args.guaranteed_gc_interval,
            control_interval_min: args.control_interval_min,
            control_interval_max: args.control_interval_max,
            control_interval_adjust_period: args.control_interval_adjust_period,
            uncommit: args.uncommit,
            uncommit_delay: args.uncommit_delay,
            adaptive_sample_frequency_hz: 10,
            adaptive_sample_size_seconds: 10,
            adaptive_decay_factor: 0.5,
            adaptive_initial_confidence: 1.8,
            adaptive_initial_spike_threshold: 1.8,
            heuristics: args.heuristics,
        };

        // Cap TLABs well below the region size; a TLAB the size of a region
        // retires whole regions per refill and wastes the tail on every
        // retirement.
        opts.max_tlab_size = (opts.region_size_bytes / 8)
            .min(opts.humongous_threshold_bytes)
            .max(opts.min_tlab_size);

        log::info!(target: "gc", "Region sizes setup complete");
        log::info!(target: "gc", "- Max heap size: {}", formatted_size(opts.max_heap_size));
        log::info!(target: "gc", "- Region count: {}", opts.region_count);
        log::info!(target: "gc", "- Region size: {}", formatted_size(opts.region_size_bytes));
        log::info!(target: "gc", "- Humongous threshold: {}", formatted_size(opts.humongous_threshold_bytes));
        log::info!(target: "gc", "- Max TLAB size: {}", formatted_size(opts.max_tlab_size));

        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts_16x256k() -> HeapOptions {
        let args = HeapArguments {
            max_heap_size: 16 * 256 * 1024,
            region_size: Some(256 * 1024),
            ..Default::default()
        };
        HeapRegion::setup_sizes(&args)
    }

    #[test]
    fn sizing_is_power_of_two() {
        let opts = opts_16x256k();
        assert_eq!(opts.region_size_bytes, 256 * 1024);
        assert_eq!(opts.region_count, 16);
        assert!(opts.region_size_bytes.is_power_of_two());
    }

    #[test]
    fn required_regions_boundaries() {
        let opts = opts_16x256k();
        let rs = opts.region_size_bytes;
        assert_eq!(opts.required_regions(1), 1);
        assert_eq!(opts.required_regions(rs), 1);
        assert_eq!(opts.required_regions(rs + 1), 2);
        assert_eq!(opts.required_regions(3 * rs), 3);
        assert_eq!(opts.required_regions(3 * rs + rs / 2), 4);
    }

    #[test]
    fn liveness_conservation() {
        let opts = opts_16x256k();
        let mut r = HeapRegion::new(0, 0x100000, &opts, true);
        r.make_regular_allocation().unwrap();
        let a = r.allocate(1024, AllocType::Shared);
        assert!(!a.is_null());
        r.allocate(2048, AllocType::Shared);

        r.set_live_data(1024);
        assert_eq!(r.used(), 3072);
        assert_eq!(r.garbage() + r.live_data(), r.used());
        assert!(r.live_data() <= r.used());
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let opts = opts_16x256k();
        let mut r = HeapRegion::new(3, 0x100000, &opts, true);

        // Humongous regions never become pinned and never enter the cset.
        r.make_humongous_start().unwrap();
        assert!(r.pin().is_err());
        assert_eq!(
            r.make_cset(),
            Err(RegionStateError {
                from: RegionState::HumongousStart,
                to: RegionState::Cset
            })
        );

        // But they may die wholesale.
        r.make_trash().unwrap();
        r.recycle();
        assert_eq!(r.state(), RegionState::EmptyCommitted);
        assert_eq!(r.used(), 0);
    }

    #[test]
    fn pinning_is_nested() {
        let opts = opts_16x256k();
        let mut r = HeapRegion::new(1, 0x100000, &opts, true);
        r.make_regular_allocation().unwrap();

        r.pin().unwrap();
        r.pin().unwrap();
        assert!(r.is_pinned());
        r.unpin().unwrap();
        assert!(r.is_pinned());
        r.unpin().unwrap();
        assert!(r.is_regular());
    }
}
