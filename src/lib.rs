//! rbgc: a low-pause, region-based, concurrent, evacuating garbage collector.
//!
//! The heap is carved into fixed power-of-two regions. A background control
//! thread drives concurrent cycles: snapshot-at-the-beginning marking,
//! evacuation of a selected collection set through Brooks-style forwarding
//! pointers, and concurrent reference updating. Interrupted cycles degenerate
//! to a stop-the-world continuation that resumes from the interrupted phase;
//! the ultimate fallback is a stop-the-world sliding mark-compact.

pub mod heap;
pub mod object;
pub mod utils;

pub use heap::heap::Heap;
pub use heap::region::{HeapArguments, HeapOptions};
pub use heap::{AllocRequest, AllocType, GCHeuristic};
pub use object::{HeapObjectHeader, Slot, SlotVisitor};

#[cfg(test)]
mod tests;
