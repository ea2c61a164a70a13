//! TEAM_523: Just-in-time memory bookkeeping.
//!
//! A client reserves a GPU virtual window for JIT use once. JIT_ALLOCATE soft
//! atoms then carve fresh allocations out of that window, each backed by a
//! driver-owned buffer. Freed allocations go to a pool and are handed back to
//! later requests with the same bin and usage, so steady-state frame loops
//! do not churn page tables. Pooled memory is given up under memory
//! pressure.
//!
//! This module only tracks addresses and ownership. The connection does the
//! mapping and page-table work under its address lock.

use std::sync::Arc;

use mali_error::define_kernel_error;
use mali_hal::{PAGE_SHIFT, PAGE_SIZE, is_page_aligned};
use mali_utils::{HashMap, Region};

use crate::address_space::VIRTUAL_ADDRESS_LIMIT;
use crate::buffer::Buffer;
use crate::gpu_mapping::MappingError;

define_kernel_error! {
    /// TEAM_523: JIT memory errors.
    pub enum JitError(0x09, "jit") {
        /// No JIT region was set up for the connection
        NotInitialized = 0x01 => "JIT region not initialized",
        /// The JIT region can only be set once
        AlreadyInitialized = 0x02 => "JIT region already initialized",
        /// Id 0 is reserved
        InvalidId = 0x03 => "Invalid JIT id",
        /// Id already names a live allocation
        IdInUse = 0x04 => "JIT id in use",
        /// Free of an id that is not allocated
        UnknownId = 0x05 => "Unknown JIT id",
        /// The window cannot fit the request
        OutOfVirtualMemory = 0x06 => "JIT region exhausted",
        /// Region is empty, unaligned or out of range
        InvalidRegion = 0x07 => "Invalid JIT region",
        /// Request asks for more committed than virtual pages
        InvalidRequest = 0x08 => "Invalid JIT request",
        /// Backing the allocation failed
        Mapping(MappingError) = 0x09 => "JIT mapping failed",
    }
}

impl From<MappingError> for JitError {
    fn from(e: MappingError) -> Self {
        JitError::Mapping(e)
    }
}

/// One allocation request carried by a JIT_ALLOCATE atom.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JitAllocationInfo {
    /// Client handle for the allocation; later named by JIT_FREE.
    pub id: u8,
    /// Pool bucket; only allocations with matching bins are reused.
    pub bin_id: u8,
    /// Cap on live allocations in this bin, 0 for none.
    pub max_allocations: u8,
    pub usage_id: u16,
    pub va_pages: u64,
    /// Pages backed immediately.
    pub committed_pages: u64,
    /// Growth step on GPU page fault. Recorded only.
    pub extend_pages: u64,
}

/// A live or pooled JIT allocation.
#[derive(Debug)]
pub struct JitAllocation {
    pub info: JitAllocationInfo,
    pub gpu_va: u64,
    pub buffer: Arc<Buffer>,
}

impl JitAllocation {
    pub fn size(&self) -> u64 {
        self.info.va_pages << PAGE_SHIFT
    }
}

/// First-fit allocator over the JIT window. Free ranges are kept sorted and
/// coalesced.
#[derive(Debug)]
pub struct JitRegion {
    window: Region,
    free: Vec<Region>,
}

impl JitRegion {
    pub fn new(window: Region) -> Self {
        Self {
            window,
            free: vec![window],
        }
    }

    pub fn window(&self) -> Region {
        self.window
    }

    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let index = self.free.iter().position(|r| r.length() >= size)?;
        let start = self.free[index].start();
        let taken = Region::from_start_and_length(start, size);
        if !self.free[index].subtract(&taken) {
            return None;
        }
        if self.free[index].is_empty() {
            self.free.remove(index);
        }
        Some(start)
    }

    pub fn free(&mut self, range: Region) {
        if range.is_empty() || !self.window.contains(&range) {
            return;
        }
        let index = self.free.partition_point(|r| r.start() < range.start());
        self.free.insert(index, range);
        // Merge with the neighbour above, then below.
        if index + 1 < self.free.len() && self.free[index].end() == self.free[index + 1].start() {
            let next = self.free.remove(index + 1);
            self.free[index].union(&next);
        }
        if index > 0 && self.free[index - 1].end() == self.free[index].start() {
            let current = self.free.remove(index);
            self.free[index - 1].union(&current);
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(Region::length).sum()
    }
}

/// Per-connection JIT state.
#[derive(Debug, Default)]
pub struct JitMemory {
    region: Option<JitRegion>,
    max_allocations: u8,
    /// Percentage of committed pages dropped when an allocation is pooled.
    trim_level: u8,
    active: HashMap<u8, JitAllocation>,
    pool: Vec<JitAllocation>,
}

impl JitMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(
        &mut self,
        gpu_va: u64,
        page_count: u64,
        max_allocations: u8,
        trim_level: u8,
    ) -> Result<(), JitError> {
        if self.region.is_some() {
            return Err(JitError::AlreadyInitialized);
        }
        if page_count == 0 || !is_page_aligned(gpu_va) || trim_level > 100 {
            return Err(JitError::InvalidRegion);
        }
        let size = page_count
            .checked_mul(PAGE_SIZE)
            .ok_or(JitError::InvalidRegion)?;
        match gpu_va.checked_add(size) {
            Some(end) if end <= VIRTUAL_ADDRESS_LIMIT => {}
            _ => return Err(JitError::InvalidRegion),
        }
        self.region = Some(JitRegion::new(Region::from_start_and_length(gpu_va, size)));
        self.max_allocations = max_allocations;
        self.trim_level = trim_level;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    pub fn region(&self) -> Option<&JitRegion> {
        self.region.as_ref()
    }

    pub fn trim_level(&self) -> u8 {
        self.trim_level
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    pub fn active(&self, id: u8) -> Option<&JitAllocation> {
        self.active.get(&id)
    }

    /// Validate a request against the live set. `Ok(false)` means the
    /// request is fine but must wait for an allocation to be freed.
    pub fn admit(&self, info: &JitAllocationInfo) -> Result<bool, JitError> {
        if info.id == 0 {
            return Err(JitError::InvalidId);
        }
        if info.va_pages == 0 || info.committed_pages > info.va_pages {
            return Err(JitError::InvalidRequest);
        }
        if self.region.is_none() {
            return Err(JitError::NotInitialized);
        }
        if self.active.contains_key(&info.id) {
            return Err(JitError::IdInUse);
        }
        if self.max_allocations != 0 && self.active.len() >= usize::from(self.max_allocations) {
            return Ok(false);
        }
        if info.max_allocations != 0 {
            let in_bin = self
                .active
                .values()
                .filter(|a| a.info.bin_id == info.bin_id)
                .count();
            if in_bin >= usize::from(info.max_allocations) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Best-fitting pooled allocation with the same bin and usage.
    pub fn take_reusable(&mut self, info: &JitAllocationInfo) -> Option<JitAllocation> {
        let index = self
            .pool
            .iter()
            .enumerate()
            .filter(|(_, a)| {
                a.info.bin_id == info.bin_id
                    && a.info.usage_id == info.usage_id
                    && a.info.va_pages >= info.va_pages
            })
            .min_by_key(|(_, a)| a.info.va_pages)
            .map(|(index, _)| index)?;
        Some(self.pool.swap_remove(index))
    }

    /// Reserve virtual space for a fresh allocation.
    pub fn reserve(&mut self, va_pages: u64) -> Option<u64> {
        self.region.as_mut()?.allocate(va_pages << PAGE_SHIFT)
    }

    /// Give virtual space back to the window.
    pub fn unreserve(&mut self, gpu_va: u64, size: u64) {
        if let Some(region) = self.region.as_mut() {
            region.free(Region::from_start_and_length(gpu_va, size));
        }
    }

    pub fn insert_active(&mut self, allocation: JitAllocation) {
        self.active.insert(allocation.info.id, allocation);
    }

    pub fn remove_active(&mut self, id: u8) -> Result<JitAllocation, JitError> {
        self.active.remove(&id).ok_or(JitError::UnknownId)
    }

    pub fn return_to_pool(&mut self, allocation: JitAllocation) {
        self.pool.push(allocation);
    }

    /// Empty the pool for the caller to unmap and unreserve.
    pub fn drain_pool(&mut self) -> Vec<JitAllocation> {
        std::mem::take(&mut self.pool)
    }

    /// Committed pages an allocation keeps once pooled.
    pub fn trimmed_page_count(&self, committed_pages: u64) -> u64 {
        committed_pages - committed_pages * u64::from(self.trim_level) / 100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: u8, va_pages: u64) -> JitAllocationInfo {
        JitAllocationInfo {
            id,
            va_pages,
            committed_pages: 1,
            ..JitAllocationInfo::default()
        }
    }

    #[test]
    fn test_region_first_fit_and_coalesce() {
        let mut region = JitRegion::new(Region::from_start_and_length(0x10_0000, 4 * PAGE_SIZE));
        let a = region.allocate(PAGE_SIZE).unwrap();
        let b = region.allocate(2 * PAGE_SIZE).unwrap();
        assert_eq!(a, 0x10_0000);
        assert_eq!(b, 0x10_1000);
        assert!(region.allocate(2 * PAGE_SIZE).is_none());

        region.free(Region::from_start_and_length(a, PAGE_SIZE));
        region.free(Region::from_start_and_length(b, 2 * PAGE_SIZE));
        assert_eq!(region.free_bytes(), 4 * PAGE_SIZE);
        // Fully coalesced again.
        assert_eq!(region.allocate(4 * PAGE_SIZE), Some(0x10_0000));
    }

    #[test]
    fn test_initialize_once() {
        let mut jit = JitMemory::new();
        assert_eq!(jit.admit(&info(1, 1)), Err(JitError::NotInitialized));
        jit.initialize(0x100_0000, 16, 2, 50).unwrap();
        assert_eq!(
            jit.initialize(0x100_0000, 16, 2, 50),
            Err(JitError::AlreadyInitialized)
        );
        assert_eq!(
            JitMemory::new().initialize(0x100_0800, 16, 2, 0),
            Err(JitError::InvalidRegion)
        );
    }

    #[test]
    fn test_admission_limits() {
        let mut jit = JitMemory::new();
        jit.initialize(0x100_0000, 16, 1, 0).unwrap();
        assert_eq!(jit.admit(&info(0, 1)), Err(JitError::InvalidId));
        assert_eq!(
            jit.admit(&JitAllocationInfo {
                committed_pages: 4,
                ..info(1, 2)
            }),
            Err(JitError::InvalidRequest)
        );
        assert_eq!(jit.admit(&info(1, 1)), Ok(true));

        let gpu_va = jit.reserve(1).unwrap();
        jit.insert_active(JitAllocation {
            info: info(1, 1),
            gpu_va,
            buffer: Buffer::new(1),
        });
        assert_eq!(jit.admit(&info(1, 1)), Err(JitError::IdInUse));
        // Connection-wide cap of one reached.
        assert_eq!(jit.admit(&info(2, 1)), Ok(false));
    }

    #[test]
    fn test_pool_reuse_matches_bin_and_usage() {
        let mut jit = JitMemory::new();
        jit.initialize(0x100_0000, 64, 0, 0).unwrap();
        for (id, pages, usage) in [(1u8, 8u64, 7u16), (2, 4, 7), (3, 4, 9)] {
            let gpu_va = jit.reserve(pages).unwrap();
            jit.return_to_pool(JitAllocation {
                info: JitAllocationInfo {
                    usage_id: usage,
                    ..info(id, pages)
                },
                gpu_va,
                buffer: Buffer::new(pages),
            });
        }

        let request = JitAllocationInfo {
            usage_id: 7,
            ..info(9, 3)
        };
        // Smallest matching allocation wins.
        let reused = jit.take_reusable(&request).unwrap();
        assert_eq!(reused.info.va_pages, 4);
        assert_eq!(reused.info.usage_id, 7);
        assert_eq!(jit.pool_len(), 2);

        let too_big = JitAllocationInfo {
            usage_id: 7,
            ..info(9, 16)
        };
        assert!(jit.take_reusable(&too_big).is_none());
    }

    #[test]
    fn test_trim_level() {
        let mut jit = JitMemory::new();
        jit.initialize(0, 16, 0, 25).unwrap();
        assert_eq!(jit.trimmed_page_count(8), 6);
        assert_eq!(jit.trimmed_page_count(0), 0);
    }
}
