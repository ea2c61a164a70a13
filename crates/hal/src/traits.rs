//! Platform service traits consumed by the driver core.
//!
//! TEAM_515: These are the seams to the bus driver. The core never touches
//! DMA pinning or interrupt objects directly, so hardware-free tests can
//! substitute the fakes in [`crate::fake`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use mali_utils::Region;

use crate::{HalError, PAGE_SIZE};

/// [M23] One host-mapped 4KB page the GPU walks as a page-table node.
/// Dropping the handle returns the page to its allocator.
pub trait TablePage: Send + Sync {
    /// Address the GPU uses to reach the page.
    fn bus_addr(&self) -> u64;

    /// Read the 64-bit entry at `index` (0..512).
    fn read_entry(&self, index: usize) -> u64;

    /// Store the 64-bit entry at `index` (0..512) into the page itself.
    fn write_entry(&self, index: usize, value: u64);

    /// Write CPU caches for the page back to memory, for GPUs that walk
    /// page tables without snooping.
    fn flush_cpu_cache(&self);
}

/// [M23] Source of zeroed pages for GPU page tables.
pub trait PageAllocator: Send + Sync {
    /// [M23] Allocate one zeroed page. [M24] It is freed when dropped.
    fn alloc_page(&self) -> Option<Box<dyn TablePage>>;
}

/// Returns pinned pages to the bus driver.
pub trait BusUnpin: Send + Sync {
    fn unpin_page_range(&self, buffer_id: u64, page_offset: u64, page_count: u64);
}

/// A pinned, DMA-addressable view of a contiguous page range of a buffer.
///
/// TEAM_531: The pin is held for the lifetime of the value. Dropping it (or
/// the pieces produced by [`BusMapping::carve`]) unpins exactly the pages it
/// still covers.
pub struct BusMapping {
    buffer_id: u64,
    page_offset: u64,
    bus_addresses: Vec<u64>,
    unpin: Option<Arc<dyn BusUnpin>>,
}

impl BusMapping {
    /// Addresses not backed by a pin; nothing is released on drop.
    pub fn new(page_offset: u64, bus_addresses: Vec<u64>) -> Self {
        Self {
            buffer_id: 0,
            page_offset,
            bus_addresses,
            unpin: None,
        }
    }

    /// Pages of `buffer_id` pinned by a bus mapper, released through `unpin`.
    pub fn pinned(
        buffer_id: u64,
        page_offset: u64,
        bus_addresses: Vec<u64>,
        unpin: Arc<dyn BusUnpin>,
    ) -> Self {
        Self {
            buffer_id,
            page_offset,
            bus_addresses,
            unpin: Some(unpin),
        }
    }

    pub fn buffer_id(&self) -> u64 {
        self.buffer_id
    }

    /// First buffer page covered.
    pub fn page_offset(&self) -> u64 {
        self.page_offset
    }

    pub fn page_count(&self) -> u64 {
        self.bus_addresses.len() as u64
    }

    /// Covered buffer pages as a region in page units.
    pub fn page_region(&self) -> Region {
        Region::from_start_and_length(self.page_offset, self.page_count())
    }

    pub fn bus_addresses(&self) -> &[u64] {
        &self.bus_addresses
    }

    /// Bus address of buffer page `page`, if covered.
    pub fn bus_address_of_page(&self, page: u64) -> Option<u64> {
        let index = page.checked_sub(self.page_offset)?;
        self.bus_addresses.get(usize::try_from(index).ok()?).copied()
    }

    /// Byte length of the pinned range.
    pub fn byte_length(&self) -> u64 {
        self.page_count() * PAGE_SIZE
    }

    /// Split off the pages inside `target` (page units). Returns the pieces
    /// outside it, in page order, and the piece inside it. Each piece keeps
    /// the pin on its own pages only.
    pub fn carve(mut self, target: &Region) -> (Vec<BusMapping>, Option<BusMapping>) {
        let region = self.page_region();
        let addresses = core::mem::take(&mut self.bus_addresses);
        let unpin = self.unpin.take();
        let piece = |range: Region| {
            let from = (range.start() - region.start()) as usize;
            let to = (range.end() - region.start()) as usize;
            BusMapping {
                buffer_id: self.buffer_id,
                page_offset: range.start(),
                bus_addresses: addresses[from..to].to_vec(),
                unpin: unpin.clone(),
            }
        };

        let outside = region
            .subtract_with_split(target)
            .into_iter()
            .filter(|range| !range.is_empty())
            .map(&piece)
            .collect();
        let mut inside = region;
        inside.intersect(target);
        let inside = (!inside.is_empty()).then(|| piece(inside));
        (outside, inside)
    }
}

impl Drop for BusMapping {
    fn drop(&mut self) {
        if let Some(unpin) = self.unpin.take() {
            if !self.bus_addresses.is_empty() {
                unpin.unpin_page_range(self.buffer_id, self.page_offset, self.page_count());
            }
        }
    }
}

impl fmt::Debug for BusMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusMapping")
            .field("buffer_id", &self.buffer_id)
            .field("pages", &self.page_region())
            .field("pinned", &self.unpin.is_some())
            .finish()
    }
}

/// Pins buffer pages for device access.
pub trait BusMapper: Send + Sync {
    /// Pin `page_count` pages of buffer `buffer_id` starting at `page_offset`.
    /// The pages stay pinned until the returned mapping is dropped.
    fn map_page_range_bus(
        &self,
        buffer_id: u64,
        page_offset: u64,
        page_count: u64,
    ) -> Result<BusMapping, HalError>;
}

/// A hardware interrupt line the driver can block on.
pub trait InterruptSource: Send + Sync {
    /// Block until the interrupt fires. Returns `InterruptCanceled` once the
    /// source is shut down.
    fn wait(&self) -> Result<(), HalError>;

    /// Re-arm the line after the handler has cleared the device status.
    fn complete(&self) {}

    /// Wake any waiter with `InterruptCanceled`.
    fn cancel(&self);
}
