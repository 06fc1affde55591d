use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Object alignment and mark-bitmap granule. Every object header starts on a
/// 16-byte boundary, so one mark bit per granule uniquely names an object.
pub const OBJECT_ALIGNMENT: usize = 16;
pub const WORD_SIZE: usize = size_of::<usize>();

/// Header preceding every heap object.
///
/// The first word is the Brooks forwarding pointer: it references the header
/// of the current copy of the object. It is initialized to point at the
/// object itself and changes exactly once per cycle, via a CAS, when the
/// object is evacuated. Every read of object memory that may run concurrently
/// with evacuation has to be routed through [`HeapObjectHeader::forwardee`].
///
/// The payload follows the header. Its first `ref_len` words are reference
/// slots (nullable pointers to other objects' headers); the remaining words
/// are opaque to the collector.
#[repr(C)]
pub struct HeapObjectHeader {
    fwd: AtomicUsize,
    size: u32,
    ref_len: u32,
}

/// The address of a reference slot: a location holding a (possibly null)
/// pointer to an object header. Roots and object fields are both slots.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Slot(pub *mut *mut HeapObjectHeader);

impl Slot {
    #[inline(always)]
    pub fn load(self) -> *mut HeapObjectHeader {
        unsafe { self.0.read() }
    }

    #[inline(always)]
    pub fn store(self, value: *mut HeapObjectHeader) {
        unsafe { self.0.write(value) }
    }
}

/// The single "visit one reference" capability. Marking, root scanning,
/// evacuation of roots, reference updating and full-GC pointer adjustment are
/// all implementations of this; a visitor may rewrite the slot it is handed.
pub trait SlotVisitor {
    fn visit(&mut self, slot: Slot);
}

impl HeapObjectHeader {
    pub const SIZE: usize = size_of::<HeapObjectHeader>();

    /// Required total allocation size (header + payload), object-aligned.
    pub const fn required_size(payload_words: usize) -> usize {
        let raw = Self::SIZE + payload_words * WORD_SIZE;
        (raw + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
    }

    /// Writes a fresh header at `addr`. The forwarding word starts out
    /// self-referential; payload reference slots are nulled.
    ///
    /// # Safety
    /// `addr` must point at `size` bytes of writable heap memory.
    pub unsafe fn initialize(
        addr: *mut u8,
        size: usize,
        ref_len: usize,
    ) -> *mut HeapObjectHeader {
        debug_assert!(size >= Self::SIZE + ref_len * WORD_SIZE);
        debug_assert!(crate::heap::is_aligned(size, OBJECT_ALIGNMENT));

        let header = addr as *mut HeapObjectHeader;
        (*header).fwd = AtomicUsize::new(addr as usize);
        (*header).size = size as u32;
        (*header).ref_len = ref_len as u32;

        let payload = (*header).payload();
        for i in 0..ref_len {
            payload.add(i).write(0);
        }

        header
    }

    /// Total object size in bytes, header included.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size as usize
    }

    #[inline(always)]
    pub fn ref_len(&self) -> usize {
        self.ref_len as usize
    }

    #[inline(always)]
    pub fn payload(&self) -> *mut usize {
        unsafe { (self as *const Self as *mut u8).add(Self::SIZE) as *mut usize }
    }

    /// The `i`-th reference slot of the payload.
    #[inline(always)]
    pub fn slot(&self, i: usize) -> Slot {
        debug_assert!(i < self.ref_len());
        Slot(unsafe { self.payload().add(i) as *mut *mut HeapObjectHeader })
    }

    /// Resolves the current copy of this object through the forwarding word.
    #[inline(always)]
    pub fn forwardee(&self) -> *mut HeapObjectHeader {
        self.fwd.load(Ordering::Acquire) as *mut HeapObjectHeader
    }

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        self.fwd.load(Ordering::Acquire) != self as *const Self as usize
    }

    /// Attempts to install `update` as the forwardee of a not-yet-forwarded
    /// object. Returns the winning forwardee: `update` if this thread won the
    /// race, the competing copy if it lost, or the already-installed value if
    /// the object was forwarded before the call. Losers must abandon their
    /// copy and use the returned address.
    #[inline]
    pub fn try_update_forwardee(&self, update: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
        let holder = self as *const Self as usize;
        match self.fwd.compare_exchange(
            holder,
            update as usize,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => update,
            Err(winner) => winner as *mut HeapObjectHeader,
        }
    }

    /// Unconditionally points the forwarding word at `dest`. Only full GC's
    /// compute-addresses phase may use this: it overloads the word to carry
    /// the compacted destination while the world is stopped.
    #[inline]
    pub fn set_forwardee_raw(&self, dest: usize) {
        self.fwd.store(dest, Ordering::Relaxed);
    }

    /// Re-points the forwarding word back at the object itself.
    #[inline]
    pub fn reset_forwardee(&self) {
        self.fwd
            .store(self as *const Self as usize, Ordering::Relaxed);
    }

    /// Visits every reference slot of this object.
    pub fn visit_edges(&self, visitor: &mut dyn SlotVisitor) {
        for i in 0..self.ref_len() {
            visitor.visit(self.slot(i));
        }
    }

    /// Visits the reference slots in `[from, to)`; marking chunks large
    /// reference arrays into such subranges.
    pub fn visit_edge_range(&self, from: usize, to: usize, visitor: &mut dyn SlotVisitor) {
        debug_assert!(to <= self.ref_len());
        for i in from..to {
            visitor.visit(self.slot(i));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::{Arc, Barrier};

    fn make_object(buf: &mut [u8], ref_len: usize) -> *mut HeapObjectHeader {
        let size = HeapObjectHeader::required_size(ref_len + 2);
        assert!(buf.len() >= size);
        unsafe { HeapObjectHeader::initialize(buf.as_mut_ptr(), size, ref_len) }
    }

    #[repr(align(16))]
    struct AlignedBuf([u8; 256]);

    #[test]
    fn forwarding_starts_self_referential() {
        let mut buf = AlignedBuf([0; 256]);
        let obj = make_object(&mut buf.0, 2);
        unsafe {
            assert!(!(*obj).is_forwarded());
            assert_eq!((*obj).forwardee(), obj);
        }
    }

    #[test]
    fn forwarding_is_idempotent() {
        let mut from = AlignedBuf([0; 256]);
        let mut to = AlignedBuf([0; 256]);
        let obj = make_object(&mut from.0, 1);
        let copy = make_object(&mut to.0, 1);

        unsafe {
            // Not forwarded: resolving twice is stable.
            assert_eq!((*(*obj).forwardee()).forwardee(), (*obj).forwardee());

            let winner = (*obj).try_update_forwardee(copy);
            assert_eq!(winner, copy);

            // Forwarded: the to-space copy points at itself, so a double
            // resolve still lands on the same address.
            assert_eq!((*obj).forwardee(), copy);
            assert_eq!((*(*obj).forwardee()).forwardee(), copy);
        }
    }

    #[test]
    fn forwarding_has_at_most_one_winner() {
        const THREADS: usize = 8;

        let mut from = AlignedBuf([0; 256]);
        let obj = make_object(&mut from.0, 0) as usize;

        let barrier = Arc::new(Barrier::new(THREADS));
        let wins = Arc::new(StdAtomicUsize::new(0));

        let mut copies = Vec::new();
        for _ in 0..THREADS {
            let mut buf = Box::new(AlignedBuf([0; 256]));
            let copy = make_object(&mut buf.0, 0) as usize;
            copies.push((buf, copy));
        }

        let handles: Vec<_> = copies
            .iter()
            .map(|(_, copy)| {
                let barrier = barrier.clone();
                let wins = wins.clone();
                let copy = *copy;
                std::thread::spawn(move || {
                    barrier.wait();
                    let winner = unsafe {
                        (*(obj as *mut HeapObjectHeader))
                            .try_update_forwardee(copy as *mut HeapObjectHeader)
                    };
                    if winner as usize == copy {
                        wins.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    }
                    winner as usize
                })
            })
            .collect();

        let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Exactly one CAS succeeded and every thread observed the same final
        // forwardee.
        assert_eq!(wins.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        unsafe {
            assert_eq!(
                (*(obj as *mut HeapObjectHeader)).forwardee() as usize,
                results[0]
            );
        }
    }
}
