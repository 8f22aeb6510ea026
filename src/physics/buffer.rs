//! Fixed-capacity append buffer shared by parallel producers.
//!
//! Candidate pairs, contact constraints, and collision events are all
//! per-step streams written concurrently by a parallel-for and consumed
//! after the producing task-graph node completes. Writers claim exclusive
//! slots with one atomic fetch-add; there are no locks. Reading requires
//! `&mut self`, which cannot coexist with writers, so the contents are
//! observed only once the producing node's joins have synchronized.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

/// Append-only slab with a fixed capacity and an overflow counter.
pub struct AppendBuffer<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    cursor: AtomicU32,
    dropped: AtomicU32,
}

// Writers own disjoint slots and readers hold `&mut self`.
unsafe impl<T: Send> Sync for AppendBuffer<T> {}

impl<T: Copy> AppendBuffer<T> {
    /// Allocate with room for `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
        Self {
            slots: slots.into_boxed_slice(),
            cursor: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of entries written so far (clamped to capacity).
    #[inline]
    pub fn len(&self) -> usize {
        (self.cursor.load(Ordering::Relaxed) as usize).min(self.slots.len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries that did not fit since the last [`Self::clear`].
    #[inline]
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append, panicking on overflow. Used where overflow means the caller
    /// misconfigured a capacity (contact constraints).
    #[inline]
    pub fn push(&self, value: T) {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;
        assert!(
            idx < self.slots.len(),
            "append buffer overflow: capacity {}",
            self.slots.len()
        );
        unsafe { (*self.slots[idx].get()).write(value) };
    }

    /// Append, deterministically dropping the entry on overflow. Returns
    /// whether the entry was kept; drops are counted for the caller.
    #[inline]
    pub fn try_push(&self, value: T) -> bool {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) as usize;
        if idx >= self.slots.len() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        unsafe { (*self.slots[idx].get()).write(value) };
        true
    }

    /// View the written entries. Exclusive access guarantees producers
    /// have finished.
    pub fn as_slice(&mut self) -> &[T] {
        let len = self.len();
        // MaybeUninit<T> is layout-compatible with T and the first `len`
        // slots are initialized.
        unsafe { std::slice::from_raw_parts(self.slots.as_ptr() as *const T, len) }
    }

    /// Reset for the next step.
    pub fn clear(&mut self) {
        self.cursor.store(0, Ordering::Release);
        self.dropped.store(0, Ordering::Release);
    }
}

impl<T> std::fmt::Debug for AppendBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendBuffer")
            .field("capacity", &self.slots.len())
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_read() {
        let mut buf = AppendBuffer::new(8);
        for i in 0..5u32 {
            buf.push(i);
        }
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.as_slice(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_try_push_overflow_counts_drops() {
        let mut buf = AppendBuffer::new(2);
        assert!(buf.try_push(1u32));
        assert!(buf.try_push(2));
        assert!(!buf.try_push(3));
        assert!(!buf.try_push(4));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.dropped(), 2);

        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.dropped(), 0);
    }

    #[test]
    #[should_panic(expected = "append buffer overflow")]
    fn test_push_overflow_panics() {
        let buf = AppendBuffer::new(1);
        buf.push(1u32);
        buf.push(2);
    }

    #[test]
    fn test_parallel_producers_claim_disjoint_slots() {
        use rayon::prelude::*;

        let mut buf = AppendBuffer::new(1000);
        (0..1000u32).into_par_iter().for_each(|i| buf.push(i));

        let mut seen: Vec<u32> = buf.as_slice().to_vec();
        seen.sort_unstable();
        let expected: Vec<u32> = (0..1000).collect();
        assert_eq!(seen, expected);
    }
}
