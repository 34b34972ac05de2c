//! Lock-free published snapshots.
//!
//! A `Snapshot<T>` is a two-element array plus an atomic index: the single
//! writer builds a complete new value in the slot the readers are *not*
//! looking at, then flips the index. Readers never block and never observe a
//! partially written value. This is the only mechanism by which the
//! transition engine, the frame store and the mirror outputs hand state to
//! other threads.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Double-buffered, lock-free single-writer/multi-reader snapshot.
///
/// Invariants (enforced by the owning component, not by this type):
/// - exactly one thread calls [`Snapshot::publish`];
/// - the writer's publish cadence is the frame loop, so a reader finishes
///   its copy of one slot long before the writer comes back around to it.
pub struct Snapshot<T: Copy> {
    slots: [UnsafeCell<T>; 2],
    /// Index of the slot readers should use.
    index: AtomicUsize,
}

// Readers copy out of one slot while the writer fills the other; `T: Copy`
// keeps the read a plain memcpy with no drop glue.
unsafe impl<T: Copy + Send> Sync for Snapshot<T> {}
unsafe impl<T: Copy + Send> Send for Snapshot<T> {}

impl<T: Copy> Snapshot<T> {
    /// Create a snapshot with both slots holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            slots: [UnsafeCell::new(initial), UnsafeCell::new(initial)],
            index: AtomicUsize::new(0),
        }
    }

    /// Publish a complete new value. Single writer only.
    pub fn publish(&self, value: T) {
        let current = self.index.load(Ordering::Relaxed);
        let next = current ^ 1;
        unsafe {
            *self.slots[next].get() = value;
        }
        self.index.store(next, Ordering::Release);
    }

    /// Read the most recently published value. Any thread, never blocks.
    pub fn read(&self) -> T {
        let current = self.index.load(Ordering::Acquire);
        unsafe { *self.slots[current].get() }
    }
}
