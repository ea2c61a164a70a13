//! A buffer window mapped into a connection's GPU address space.
//!
//! TEAM_520: A mapping is created up front over a page window of the buffer,
//! but pages are only backed (pinned and written into the page tables) when
//! the client commits them. The pinned pieces are kept as non-overlapping
//! bus mappings keyed by their first buffer page; their union is the
//! committed set.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use mali_error::define_kernel_error;
use mali_hal::{BusMapping, HalError, PAGE_SHIFT, is_page_aligned};
use mali_utils::Region;

use crate::address_space::{AccessFlags, MmuError, VIRTUAL_ADDRESS_LIMIT};
use crate::buffer::Buffer;

define_kernel_error! {
    /// TEAM_520: GPU mapping errors.
    pub enum MappingError(0x05, "mapping") {
        /// Unaligned, empty, or outside the buffer or address space
        InvalidRange = 0x01 => "Invalid mapping range",
        /// GPU range collides with an existing mapping
        Overlap = 0x02 => "Mapping overlaps an existing mapping",
        /// No mapping at that address
        NotFound = 0x03 => "No mapping at address",
        /// The buffer has been released
        BufferGone = 0x04 => "Buffer released",
        /// Updating the page tables failed
        PageTable(MmuError) = 0x05 => "Page table update failed",
        /// Pinning pages failed
        Bus(HalError) = 0x06 => "Bus mapping failed",
    }
}

impl From<MmuError> for MappingError {
    fn from(e: MmuError) -> Self {
        MappingError::PageTable(e)
    }
}

impl From<HalError> for MappingError {
    fn from(e: HalError) -> Self {
        MappingError::Bus(e)
    }
}

#[derive(Debug)]
pub struct GpuMapping {
    gpu_va: u64,
    /// First buffer page of the window.
    page_offset: u64,
    page_count: u64,
    access: AccessFlags,
    buffer_id: u64,
    buffer: Weak<Buffer>,
    bus_mappings: BTreeMap<u64, BusMapping>,
}

impl GpuMapping {
    /// Window of `size` bytes starting at buffer page `page_offset`, placed
    /// at `gpu_va`.
    pub fn new(
        gpu_va: u64,
        page_offset: u64,
        size: u64,
        access: AccessFlags,
        buffer: &Arc<Buffer>,
    ) -> Result<Self, MappingError> {
        if size == 0 || !is_page_aligned(size) || !is_page_aligned(gpu_va) {
            return Err(MappingError::InvalidRange);
        }
        match gpu_va.checked_add(size) {
            Some(end) if end <= VIRTUAL_ADDRESS_LIMIT => {}
            _ => return Err(MappingError::InvalidRange),
        }
        let page_count = size >> PAGE_SHIFT;
        if page_offset.saturating_add(page_count) > buffer.page_count() {
            return Err(MappingError::InvalidRange);
        }
        Ok(Self {
            gpu_va,
            page_offset,
            page_count,
            access,
            buffer_id: buffer.id(),
            buffer: Arc::downgrade(buffer),
            bus_mappings: BTreeMap::new(),
        })
    }

    pub fn gpu_va(&self) -> u64 {
        self.gpu_va
    }

    pub fn size(&self) -> u64 {
        self.page_count << PAGE_SHIFT
    }

    pub fn page_offset(&self) -> u64 {
        self.page_offset
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    pub fn buffer_id(&self) -> u64 {
        self.buffer_id
    }

    pub fn buffer(&self) -> Option<Arc<Buffer>> {
        self.buffer.upgrade()
    }

    /// GPU virtual range in bytes.
    pub fn gpu_region(&self) -> Region {
        Region::from_start_and_length(self.gpu_va, self.size())
    }

    /// Buffer pages covered by the window.
    pub fn page_window(&self) -> Region {
        Region::from_start_and_length(self.page_offset, self.page_count)
    }

    /// GPU address that buffer page `page` is mapped at.
    pub fn gpu_va_of_page(&self, page: u64) -> u64 {
        self.gpu_va + ((page - self.page_offset) << PAGE_SHIFT)
    }

    /// Committed buffer pages, sorted and with adjacent pieces merged.
    pub fn committed_regions(&self) -> Vec<Region> {
        let mut merged: Vec<Region> = Vec::new();
        for region in self.bus_mappings.values().map(BusMapping::page_region) {
            match merged.last_mut() {
                Some(last) if last.end() == region.start() => last.union(&region),
                _ => merged.push(region),
            }
        }
        merged
    }

    pub fn committed_page_count(&self) -> u64 {
        self.bus_mappings.values().map(BusMapping::page_count).sum()
    }

    /// Pages of `target` inside the window that are not committed yet.
    pub fn uncommitted_within(&self, target: &Region) -> Vec<Region> {
        let mut window = self.page_window();
        window.intersect(target);
        if window.is_empty() {
            return Vec::new();
        }

        let mut gaps = Vec::new();
        let mut cursor = window.start();
        for region in self.committed_regions() {
            if region.end() <= cursor {
                continue;
            }
            if region.start() >= window.end() {
                break;
            }
            if region.start() > cursor {
                gaps.push(Region::from_start_and_end(cursor, region.start()));
            }
            cursor = region.end();
        }
        if cursor < window.end() {
            gaps.push(Region::from_start_and_end(cursor, window.end()));
        }
        gaps
    }

    /// Record newly pinned pages. They must lie in the window and not
    /// overlap pages already committed.
    pub fn add_bus_mapping(&mut self, mapping: BusMapping) -> Result<(), MappingError> {
        let region = mapping.page_region();
        if region.is_empty() || !self.page_window().contains(&region) {
            return Err(MappingError::InvalidRange);
        }
        if self
            .bus_mappings
            .values()
            .any(|existing| existing.page_region().overlaps(&region))
        {
            return Err(MappingError::Overlap);
        }
        self.bus_mappings.insert(region.start(), mapping);
        Ok(())
    }

    /// Detach committed pages inside `target`, splitting pinned pieces that
    /// straddle its edges. Returns the removed page ranges, merged, and the
    /// pinned pieces that covered them. The caller must clear the page
    /// tables before dropping those pieces, which unpins them.
    pub fn remove_pages(&mut self, target: &Region) -> (Vec<Region>, Vec<BusMapping>) {
        let affected: Vec<u64> = self
            .bus_mappings
            .iter()
            .filter(|(_, mapping)| mapping.page_region().overlaps(target))
            .map(|(start, _)| *start)
            .collect();

        let mut removed: Vec<Region> = Vec::new();
        let mut released = Vec::new();
        for start in affected {
            let Some(mapping) = self.bus_mappings.remove(&start) else {
                continue;
            };
            let (kept, gone) = mapping.carve(target);
            for piece in kept {
                self.bus_mappings.insert(piece.page_offset(), piece);
            }
            if let Some(gone) = gone {
                let cut = gone.page_region();
                match removed.last_mut() {
                    Some(last) if last.end() == cut.start() => last.union(&cut),
                    _ => removed.push(cut),
                }
                released.push(gone);
            }
        }
        (removed, released)
    }
}
