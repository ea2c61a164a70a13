#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod handle;
pub mod region;

pub use handle::{Handle, HandleTable};
pub use region::Region;

// TEAM_211: Re-export spin crate types as our lock API
// Note: spin::Mutex is re-exported as SpinMutex; blocking waits use parking_lot in the driver
pub use spin::{Mutex as SpinMutex, MutexGuard as SpinMutexGuard};

// TEAM_212: Re-export hashbrown collections
pub use hashbrown::{HashMap, HashSet};

/// Fixed-capacity FIFO of `Copy` records.
///
/// `push` refuses new items when full; `push_overwrite` drops the oldest
/// record instead, which is what debug history rings want.
pub struct RingBuffer<T: Copy, const N: usize> {
    buffer: [T; N],
    head: usize,
    tail: usize,
    full: bool,
}

impl<T: Copy + Default, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy, const N: usize> RingBuffer<T, N> {
    /// [R1] New buffer is empty
    #[must_use]
    pub const fn new(default_val: T) -> Self {
        Self {
            buffer: [default_val; N],
            head: 0,
            tail: 0,
            full: false,
        }
    }

    /// [R2] Push adds element, [R4] returns false when full
    pub fn push(&mut self, item: T) -> bool {
        if self.full || N == 0 {
            return false; // [R4]
        }

        self.buffer[self.head] = item; // [R2]
        self.head = (self.head + 1) % N; // [R6] wrap around
        self.full = self.head == self.tail;
        true
    }

    /// [R9] Push that evicts the oldest element when full. Returns the evicted one.
    pub fn push_overwrite(&mut self, item: T) -> Option<T> {
        if N == 0 {
            return Some(item);
        }
        let evicted = if self.full { self.pop() } else { None };
        self.push(item);
        evicted
    }

    /// [R3] Pop removes oldest (FIFO), [R5] returns None when empty
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None; // [R5]
        }

        let item = self.buffer[self.tail]; // [R3] FIFO order
        self.tail = (self.tail + 1) % N; // [R6] wrap around
        self.full = false;
        Some(item)
    }

    /// [R7] returns true when empty, [R8] returns false when has data
    pub fn is_empty(&self) -> bool {
        !self.full && self.head == self.tail
    }

    pub fn len(&self) -> usize {
        if self.full {
            N
        } else if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.head + N - self.tail
        }
    }

    /// Oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len()).map(move |i| self.buffer[(self.tail + i) % N])
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
