use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::sync::Arc;

use crate::heap::concurrent_gc::ConcurrentGC;
use crate::heap::degenerated_gc::DegeneratedGC;
use crate::heap::evacuation::evacuate_collection_set;
use crate::heap::full_gc::FullGC;
use crate::heap::heap::{Heap, RootProvider};
use crate::heap::mark::{run_marking, MarkConfig};
use crate::heap::region::{HeapArguments, RegionState};
use crate::heap::write_barrier::resolve;
use crate::heap::{DegenPoint, GCCause, GCHeuristic};
use crate::object::{HeapObjectHeader, Slot, SlotVisitor};

const REGION: usize = 256 * 1024;

/// Root table for tests: a plain vector of handles the collector sees as
/// root slots. Only mutated between collections.
struct TestRoots {
    slots: UnsafeCell<Vec<*mut HeapObjectHeader>>,
}

unsafe impl Send for TestRoots {}
unsafe impl Sync for TestRoots {}

impl TestRoots {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slots: UnsafeCell::new(Vec::new()),
        })
    }

    fn push(&self, obj: *mut HeapObjectHeader) {
        unsafe { (*self.slots.get()).push(obj) }
    }

    fn get(&self, i: usize) -> *mut HeapObjectHeader {
        unsafe { (&(*self.slots.get()))[i] }
    }
}

struct SharedRoots(Arc<TestRoots>);

impl RootProvider for SharedRoots {
    fn scan_roots(&self, visitor: &mut dyn SlotVisitor, worker_id: usize, _nworkers: usize) {
        if worker_id != 0 {
            return;
        }
        let slots = unsafe { &mut *self.0.slots.get() };
        for slot in slots.iter_mut() {
            visitor.visit(Slot(slot as *mut *mut HeapObjectHeader));
        }
    }
}

fn test_heap(heuristics: GCHeuristic) -> (&'static Heap, Arc<TestRoots>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let args = HeapArguments {
        heuristics,
        max_heap_size: 16 * REGION,
        region_size: Some(REGION),
        parallel_gc_threads: Some(1),
        concurrent_gc_threads: Some(1),
        guaranteed_gc_interval: 0,
        uncommit: false,
        start_control_thread: false,
        ..Default::default()
    };
    let heap: &'static Heap = Heap::new(args);
    let roots = TestRoots::new();
    heap.add_root_provider(Box::new(SharedRoots(roots.clone())));
    (heap, roots)
}

fn alloc(heap: &Heap, payload_words: usize, ref_len: usize) -> *mut HeapObjectHeader {
    let obj = heap.allocate_object(None, payload_words, ref_len);
    assert!(!obj.is_null(), "test allocation failed");
    obj
}

fn link(a: *mut HeapObjectHeader, i: usize, b: *mut HeapObjectHeader) {
    unsafe { (*a).slot(i).store(b) }
}

fn next(heap: &Heap, obj: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
    unsafe { resolve(heap, (*obj).slot(0).load()) }
}

/// Payload words for an object of `bytes` total size (header included).
fn payload_for(bytes: usize) -> usize {
    (bytes - HeapObjectHeader::SIZE) / crate::object::WORD_SIZE
}

fn walk_chain(heap: &Heap, head: *mut HeapObjectHeader) -> Vec<*mut HeapObjectHeader> {
    let mut nodes = Vec::new();
    let mut cur = resolve(heap, head);
    while !cur.is_null() {
        nodes.push(cur);
        cur = next(heap, cur);
    }
    nodes
}

fn assert_liveness_conservation(heap: &Heap) {
    for i in 0..heap.num_regions() {
        let r = heap.get_region(i);
        unsafe {
            if (*r).is_humongous() {
                continue; // the start region accounts for the whole run
            }
            // garbage() itself asserts live <= used.
            assert_eq!(
                (*r).garbage() + (*r).live_data(),
                (*r).used(),
                "region {}",
                i
            );
        }
    }
}

#[test]
fn basic_allocate_mark_evacuate_reclaim_cycle() {
    let (heap, roots) = test_heap(GCHeuristic::Aggressive);

    // A 64-node live chain of 2KB objects...
    let obj_words = payload_for(2048);
    let head = alloc(heap, obj_words, 1);
    roots.push(head);
    let mut prev = head;
    for _ in 0..63 {
        let node = alloc(heap, obj_words, 1);
        link(prev, 0, node);
        prev = node;
    }
    // ...buried in eight regions' worth of garbage.
    for _ in 0..8 * 128 {
        alloc(heap, obj_words, 0);
    }

    // The aggressive policy fires unconditionally.
    assert!(heap.should_start_gc());

    let mut gc = ConcurrentGC::new(heap);
    assert!(gc.collect(), "concurrent cycle must complete");

    assert!(!heap.cancelled_gc());
    assert!(heap.collection_set().is_empty());
    assert!(!heap.has_forwarded_objects());

    // The chain survived intact; roots were healed to the new copies.
    let nodes = walk_chain(heap, roots.get(0));
    assert_eq!(nodes.len(), 64);

    let live_regions: HashSet<usize> = nodes
        .iter()
        .map(|&n| heap.region_index(n as usize))
        .collect();

    for i in 0..heap.num_regions() {
        let r = heap.get_region(i);
        unsafe {
            if live_regions.contains(&i) {
                assert!((*r).live_data() > 0, "live region {} reports no liveness", i);
            } else {
                // Everything unreachable was recycled wholesale.
                assert_eq!((*r).state(), RegionState::EmptyCommitted, "region {}", i);
                assert_eq!((*r).used(), 0, "region {}", i);
            }
        }
    }

    assert_liveness_conservation(heap);
    heap.free_set().assert_partitioned();
}

#[test]
fn evacuation_oom_escalates_to_full_gc() {
    let (heap, roots) = test_heap(GCHeuristic::Aggressive);

    // Fill every region to the brim: sixteen 16KB objects per region, the
    // first of each chained and live, the rest garbage. No free region is
    // left anywhere, so evacuation cannot allocate a single copy.
    let obj_words = payload_for(16 * 1024);
    let mut prev: *mut HeapObjectHeader = std::ptr::null_mut();
    for _ in 0..16 {
        for k in 0..16 {
            let obj = alloc(heap, obj_words, 1);
            if k == 0 {
                if prev.is_null() {
                    roots.push(obj);
                } else {
                    link(prev, 0, obj);
                }
                prev = obj;
            }
        }
    }
    assert_eq!(heap.used(), heap.max_capacity());

    let mut gc = ConcurrentGC::new(heap);
    assert!(!gc.collect(), "evacuation must fail for lack of space");
    assert_eq!(heap.cancelled_cause(), GCCause::EvacOom);
    assert_eq!(gc.degen_point(), DegenPoint::ConcurrentEvac);

    // The control thread routes an evacuation OOM straight to Full GC.
    let mut full = FullGC::new(heap);
    full.collect();

    assert!(!heap.cancelled_gc(), "full gc clears the cancellation");

    // All sixteen live objects survived and sit compacted at the bottom of
    // the region array: once an empty region shows up, no used one follows.
    let nodes = walk_chain(heap, roots.get(0));
    assert_eq!(nodes.len(), 16);

    let mut seen_empty = false;
    for i in 0..heap.num_regions() {
        let used = unsafe { (*heap.get_region(i)).used() };
        if used == 0 {
            seen_empty = true;
        } else {
            assert!(!seen_empty, "hole below used region {}", i);
        }
    }
    assert_eq!(heap.used(), 16 * 16 * 1024);
    assert_liveness_conservation(heap);
    heap.free_set().assert_partitioned();
}

#[test]
fn degenerated_gc_resumes_from_evacuation_point() {
    let (heap, roots) = test_heap(GCHeuristic::Halfway);

    // Four regions, each half live (chained 16KB objects) and half garbage,
    // comfortably above the cset garbage threshold.
    let obj_words = payload_for(16 * 1024);
    let mut prev: *mut HeapObjectHeader = std::ptr::null_mut();
    for _ in 0..4 {
        for k in 0..16 {
            let obj = alloc(heap, obj_words, 1);
            if k % 2 == 0 {
                if prev.is_null() {
                    roots.push(obj);
                } else {
                    link(prev, 0, obj);
                }
                prev = obj;
            }
        }
    }

    // Drive the cycle up to (and including) final mark by hand.
    let mut gc = ConcurrentGC::new(heap);
    gc.entry_init_mark();
    run_marking(
        heap,
        MarkConfig {
            cancellable: true,
            drain_satb: true,
            count_liveness: true,
            update_refs: false,
        },
    );
    assert!(gc.entry_final_mark(), "cset must not be empty");

    // Cancel exactly inside the evacuation window; the concurrent pass
    // observes the flag and abandons its claim loop early.
    heap.cancel_gc(GCCause::AllocFailure);
    evacuate_collection_set(heap);
    assert!(heap.cancelled_gc());

    let mut degen = DegeneratedGC::new(heap, DegenPoint::ConcurrentEvac);
    assert!(degen.collect());

    // The continuation resumed at evacuation: had it restarted marking, the
    // next bitmap would carry fresh marks.
    let marks_after = heap
        .marking_context()
        .next_bitmap()
        .count_marked(heap.mem_start(), heap.mem_start() + heap.max_capacity());
    assert_eq!(marks_after, 0, "degenerated continuation must not re-mark");

    assert!(!heap.cancelled_gc());
    assert!(heap.collection_set().is_empty());
    assert!(!heap.has_forwarded_objects());

    let nodes = walk_chain(heap, roots.get(0));
    assert_eq!(nodes.len(), 32);
    assert_liveness_conservation(heap);
    heap.free_set().assert_partitioned();
}

#[test]
fn collection_set_excludes_humongous_pinned_and_zero_live() {
    let (heap, roots) = test_heap(GCHeuristic::Aggressive);
    let obj_words = payload_for(16 * 1024);

    // Region with live data and garbage: the one real candidate.
    let mut prev: *mut HeapObjectHeader = std::ptr::null_mut();
    let mut candidate_region = 0;
    for k in 0..16 {
        let obj = alloc(heap, obj_words, 1);
        candidate_region = heap.region_index(obj as usize);
        if k % 2 == 0 {
            if prev.is_null() {
                roots.push(obj);
            } else {
                link(prev, 0, obj);
            }
            prev = obj;
        }
    }

    // A live humongous object spanning two regions.
    let humongous = alloc(heap, payload_for(REGION * 3 / 2), 0);
    roots.push(humongous);
    let humongous_region = heap.region_index(humongous as usize);

    // A region with live data that gets pinned.
    let mut prev: *mut HeapObjectHeader = std::ptr::null_mut();
    let mut pinned_region = 0;
    for k in 0..16 {
        let obj = alloc(heap, obj_words, 1);
        pinned_region = heap.region_index(obj as usize);
        if k % 2 == 0 {
            if prev.is_null() {
                roots.push(obj);
            } else {
                link(prev, 0, obj);
            }
            prev = obj;
        }
    }
    unsafe {
        (*heap.get_region(pinned_region)).pin().unwrap();
    }

    // A region with nothing but garbage.
    let mut dead_region = 0;
    for _ in 0..16 {
        let obj = alloc(heap, obj_words, 0);
        dead_region = heap.region_index(obj as usize);
    }

    let mut gc = ConcurrentGC::new(heap);
    gc.entry_init_mark();
    run_marking(
        heap,
        MarkConfig {
            cancellable: true,
            drain_satb: true,
            count_liveness: true,
            update_refs: false,
        },
    );
    assert!(gc.entry_final_mark());

    let cset = heap.collection_set();
    assert!(cset.is_in(candidate_region));
    assert!(!cset.is_in(humongous_region));
    assert!(!cset.is_in(humongous_region + 1));
    assert!(!cset.is_in(pinned_region));
    assert!(!cset.is_in(dead_region));

    // Zero-live regions are reclaimed directly, never evacuated.
    unsafe {
        assert!((*heap.get_region(dead_region)).is_trash());
    }
    for &index in cset.regions() {
        unsafe {
            let r = heap.get_region(index);
            assert!((*r).is_cset());
            assert!((*r).live_data() > 0);
        }
    }

    // Let the interrupted cycle run to completion before tearing down.
    let mut degen = DegeneratedGC::new(heap, DegenPoint::ConcurrentEvac);
    assert!(degen.collect());
    unsafe {
        (*heap.get_region(pinned_region)).unpin().unwrap();
    }

    assert_eq!(walk_chain(heap, roots.get(0)).len(), 8);
    assert_eq!(walk_chain(heap, roots.get(2)).len(), 8);
    assert_liveness_conservation(heap);
}

#[test]
fn humongous_allocation_spans_correct_region_count() {
    let (heap, roots) = test_heap(GCHeuristic::Halfway);

    // 3.5 regions' worth of object occupies exactly 4 contiguous regions.
    let size = REGION * 7 / 2;
    let obj = alloc(heap, payload_for(size), 0);
    roots.push(obj);

    let first = heap.region_index(obj as usize);
    unsafe {
        assert_eq!(
            (*heap.get_region(first)).state(),
            RegionState::HumongousStart
        );
        for k in 1..4 {
            assert_eq!(
                (*heap.get_region(first + k)).state(),
                RegionState::HumongousCont,
                "continuation {}",
                k
            );
        }
        assert!(!(*heap.get_region(first + 4)).is_humongous());
    }

    // required_regions at the boundaries: exactly divisible vs. remainder.
    let opts = heap.options();
    assert_eq!(opts.required_regions(size), 4);
    assert_eq!(opts.required_regions(3 * REGION), 3);
    assert_eq!(opts.required_regions(3 * REGION + 1), 4);
    assert_eq!(opts.required_regions(4 * REGION), 4);
}

#[test]
fn coalesced_update_refs_heals_on_next_cycle() {
    let (heap, roots) = test_heap(GCHeuristic::Lazy);

    // Two regions, half live with chained 16KB objects; the lazy policy
    // coalesces update-refs into the following cycle's mark.
    let obj_words = payload_for(16 * 1024);
    let mut prev: *mut HeapObjectHeader = std::ptr::null_mut();
    for _ in 0..2 {
        for k in 0..16 {
            let obj = alloc(heap, obj_words, 1);
            if k % 2 == 0 {
                if prev.is_null() {
                    roots.push(obj);
                } else {
                    link(prev, 0, obj);
                }
                prev = obj;
            }
        }
    }

    let mut first = ConcurrentGC::new(heap);
    assert!(first.collect());

    // The shortcut leaves the forwarding window open: the collection set is
    // still standing and readers resolve through the Brooks word.
    assert!(heap.has_forwarded_objects());
    assert!(!heap.collection_set().is_empty());
    let nodes = walk_chain(heap, roots.get(0));
    assert_eq!(nodes.len(), 16);

    // The next cycle's mark rewrites every stale reference and reclaims the
    // old collection set.
    let mut second = ConcurrentGC::new(heap);
    assert!(second.collect());

    assert!(!heap.has_forwarded_objects());
    assert!(heap.collection_set().is_empty());

    let nodes = walk_chain(heap, roots.get(0));
    assert_eq!(nodes.len(), 16);
    for &node in &nodes {
        unsafe {
            // No reachable reference is stale anymore.
            let child = (*node).slot(0).load();
            if !child.is_null() {
                assert_eq!((*child).forwardee(), child);
            }
        }
    }
    assert_liveness_conservation(heap);
    heap.free_set().assert_partitioned();
}

#[test]
fn mutator_threads_stop_at_safepoints() {
    let (heap, _roots) = test_heap(GCHeuristic::Halfway);

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let stop = stop.clone();
            std::thread::spawn(move || {
                let thread = heap.attach_mutator();
                let mut allocated = 0usize;
                while !stop.load(std::sync::atomic::Ordering::Acquire) {
                    thread.safepoint();
                    let obj = heap.allocate_object(Some(thread), 30, 0);
                    if !obj.is_null() {
                        allocated += 1;
                    }
                    if allocated > 50_000 {
                        allocated = 0;
                    }
                    std::hint::spin_loop();
                }
                heap.detach_mutator(thread);
            })
        })
        .collect();

    // Let every mutator attach and spin, then stop the world a few times
    // underneath them.
    while heap.threads().count() < 4 {
        std::thread::yield_now();
    }
    std::thread::sleep(std::time::Duration::from_millis(20));
    for _ in 0..3 {
        let threads = crate::heap::safepoint::SafepointSynchronize::begin(heap);
        assert_eq!(threads.len(), 4);
        heap.retire_tlabs();
        crate::heap::safepoint::SafepointSynchronize::end(heap);
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    stop.store(true, std::sync::atomic::Ordering::Release);
    for handle in handles {
        handle.join().unwrap();
    }
}
