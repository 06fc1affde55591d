use std::sync::atomic::{AtomicUsize, Ordering};

use super::DynBitmap;

/// Membership and work-claiming state for the current collection set.
///
/// Membership is mutated only inside safepoints (selection at final mark,
/// clearing after the cycle), so the bitmap needs no atomics; the claim
/// cursor is atomic because evacuation and update-refs workers race over it.
/// The cursor is not reset between a cancelled concurrent phase and its
/// degenerated continuation, which is exactly what makes the continuation
/// resume with the regions nobody claimed yet.
pub struct CollectionSet {
    map: DynBitmap,
    regions: Vec<usize>,
    claim: AtomicUsize,
    garbage: usize,
    live: usize,
}

impl CollectionSet {
    pub fn new(region_count: usize) -> Self {
        Self {
            map: DynBitmap::contained(region_count),
            regions: Vec::new(),
            claim: AtomicUsize::new(0),
            garbage: 0,
            live: 0,
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.regions.clear();
        self.claim.store(0, Ordering::Release);
        self.garbage = 0;
        self.live = 0;
    }

    pub fn add_region(&mut self, index: usize, garbage: usize, live: usize) {
        debug_assert!(!self.map.get(index));
        self.map.set(index, true);
        self.regions.push(index);
        self.garbage += garbage;
        self.live += live;
    }

    #[inline]
    pub fn is_in(&self, index: usize) -> bool {
        self.map.get(index)
    }

    pub fn count(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn regions(&self) -> &[usize] {
        &self.regions
    }

    pub fn garbage(&self) -> usize {
        self.garbage
    }

    pub fn live(&self) -> usize {
        self.live
    }

    /// Hands out the next unprocessed cset region, or None when all regions
    /// are claimed.
    pub fn claim_next(&self) -> Option<usize> {
        let at = self.claim.fetch_add(1, Ordering::AcqRel);
        self.regions.get(at).copied()
    }

    pub fn reset_claim(&self) {
        self.claim.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::CollectionSet;

    #[test]
    fn claim_next_hands_out_each_region_once() {
        let mut cset = CollectionSet::new(8);
        cset.add_region(3, 100, 10);
        cset.add_region(5, 80, 20);
        cset.add_region(1, 60, 30);

        assert!(cset.is_in(3) && cset.is_in(5) && cset.is_in(1));
        assert!(!cset.is_in(0));
        assert_eq!(cset.garbage(), 240);
        assert_eq!(cset.live(), 60);

        let mut claimed = Vec::new();
        while let Some(idx) = cset.claim_next() {
            claimed.push(idx);
        }
        assert_eq!(claimed, vec![3, 5, 1]);
        assert_eq!(cset.claim_next(), None);
    }
}
