//! TEAM_514: Generation-checked handle arena.
//!
//! Objects handed across the client ABI are stored here and referred to by
//! an opaque 64-bit value: slot index in the low half, generation in the high
//! half. Releasing a handle bumps the slot generation, so a stale value held
//! by a misbehaving client resolves to `None` instead of a recycled object.

use alloc::vec::Vec;

/// Opaque reference to an entry of a [`HandleTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Raw value passed over the ABI.
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of `T` addressed by generation-checked handles.
pub struct HandleTable<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    /// Store `value` and return its handle. Generation 0 is never issued so
    /// a zeroed raw value is always invalid.
    pub fn insert(&mut self, value: T) -> Handle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            return Handle {
                index,
                generation: entry.generation,
            };
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 1,
            value: Some(value),
        });
        Handle {
            index,
            generation: 1,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.entries
            .get(handle.index as usize)
            .filter(|entry| entry.generation == handle.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    /// Remove the entry; the slot is recycled under a new generation.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let entry = self.entries.get_mut(handle.index as usize)?;
        if entry.generation != handle.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut table = HandleTable::new();
        let a = table.insert("a");
        let b = table.insert("b");
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.get(b), Some(&"b"));
        assert_eq!(table.remove(a), Some("a"));
        assert_eq!(table.get(a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let mut table = HandleTable::new();
        let old = table.insert(1u32);
        table.remove(old);
        let new = table.insert(2u32);
        // Same slot, different generation.
        assert_eq!(old.to_raw() as u32, new.to_raw() as u32);
        assert_eq!(table.get(old), None);
        assert_eq!(table.get(new), Some(&2));
        assert_eq!(table.remove(old), None);
    }

    #[test]
    fn test_raw_round_trip_and_zero_invalid() {
        let mut table = HandleTable::new();
        let h = table.insert(5u8);
        assert_eq!(table.get(Handle::from_raw(h.to_raw())), Some(&5));
        assert_eq!(table.get(Handle::from_raw(0)), None);
    }
}
