//! Host-side fakes of the platform services.
//!
//! TEAM_516: Used by unit and scenario tests to run the driver core without
//! hardware. The register fake models just enough behaviour for the core's
//! polling loops: IRQ clear registers clear raw status bits, reset commands
//! raise RESET_COMPLETED, and status registers read back as idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::regs::{
    GPU_COMMAND, GPU_IRQ_CLEAR, GPU_IRQ_RAWSTAT, GPU_IRQ_STATUS, GpuCommand, GpuIrq,
    JOB_IRQ_CLEAR, JOB_IRQ_RAWSTAT, JOB_IRQ_STATUS, MMU_IRQ_CLEAR, MMU_IRQ_RAWSTAT,
    MMU_IRQ_STATUS,
};
use crate::traits::{BusMapper, BusMapping, BusUnpin, InterruptSource, PageAllocator, TablePage};
use crate::{HalError, PAGE_SIZE};

// ============================================================================
// Registers
// ============================================================================

/// Sparse register file that records every write.
#[derive(Default)]
pub struct FakeRegisterIo {
    values: Mutex<HashMap<u32, u32>>,
    writes: Mutex<Vec<(u32, u32)>>,
}

impl FakeRegisterIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset a register as if the hardware had updated it.
    pub fn set(&self, offset: u32, value: u32) {
        self.values.lock().insert(offset, value);
    }

    /// Every `(offset, value)` written so far, in order.
    pub fn writes(&self) -> Vec<(u32, u32)> {
        self.writes.lock().clone()
    }

    /// Writes to one register, in order.
    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        self.writes
            .lock()
            .iter()
            .filter(|(o, _)| *o == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    fn clear_irq(values: &mut HashMap<u32, u32>, rawstat: u32, status: u32, bits: u32) {
        let raw = values.get(&rawstat).copied().unwrap_or(0) & !bits;
        values.insert(rawstat, raw);
        values.insert(status, raw);
    }
}

impl crate::RegisterIo for FakeRegisterIo {
    fn read32(&self, offset: u32) -> u32 {
        self.values.lock().get(&offset).copied().unwrap_or(0)
    }

    fn write32(&self, offset: u32, value: u32) {
        self.writes.lock().push((offset, value));
        let mut values = self.values.lock();
        match offset {
            GPU_IRQ_CLEAR => Self::clear_irq(&mut values, GPU_IRQ_RAWSTAT, GPU_IRQ_STATUS, value),
            JOB_IRQ_CLEAR => Self::clear_irq(&mut values, JOB_IRQ_RAWSTAT, JOB_IRQ_STATUS, value),
            MMU_IRQ_CLEAR => Self::clear_irq(&mut values, MMU_IRQ_RAWSTAT, MMU_IRQ_STATUS, value),
            GPU_COMMAND
                if value == GpuCommand::SoftReset as u32 || value == GpuCommand::HardReset as u32 =>
            {
                let raw = values.get(&GPU_IRQ_RAWSTAT).copied().unwrap_or(0)
                    | GpuIrq::RESET_COMPLETED.bits();
                values.insert(GPU_IRQ_RAWSTAT, raw);
            }
            _ => {
                values.insert(offset, value);
            }
        }
    }
}

// ============================================================================
// Memory
// ============================================================================

const ENTRIES_PER_PAGE: usize = (PAGE_SIZE / 8) as usize;

#[derive(Default)]
struct PageMemory {
    /// Live pages by bus address.
    pages: Mutex<HashMap<u64, Box<[u64; ENTRIES_PER_PAGE]>>>,
    allocated: AtomicUsize,
    freed: AtomicUsize,
    cache_flushes: AtomicUsize,
}

/// A page handed out by [`FakePageAllocator`], backed by host memory the
/// test can inspect by bus address.
struct FakeTablePage {
    bus_addr: u64,
    memory: Arc<PageMemory>,
}

impl TablePage for FakeTablePage {
    fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    fn read_entry(&self, index: usize) -> u64 {
        self.memory
            .pages
            .lock()
            .get(&self.bus_addr)
            .map_or(0, |page| page[index])
    }

    fn write_entry(&self, index: usize, value: u64) {
        if let Some(page) = self.memory.pages.lock().get_mut(&self.bus_addr) {
            page[index] = value;
        }
    }

    fn flush_cpu_cache(&self) {
        self.memory.cache_flushes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for FakeTablePage {
    fn drop(&mut self) {
        self.memory.pages.lock().remove(&self.bus_addr);
        self.memory.freed.fetch_add(1, Ordering::SeqCst); // [M24]
    }
}

/// Bump allocator for page-table pages with allocation accounting.
pub struct FakePageAllocator {
    next: Mutex<u64>,
    memory: Arc<PageMemory>,
    limit: Mutex<Option<usize>>,
}

impl Default for FakePageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePageAllocator {
    pub fn new() -> Self {
        Self {
            next: Mutex::new(0x1000_0000),
            memory: Arc::new(PageMemory::default()),
            limit: Mutex::new(None),
        }
    }

    /// Fail allocations once `live` pages are outstanding.
    pub fn set_limit(&self, live: Option<usize>) {
        *self.limit.lock() = live;
    }

    pub fn allocated(&self) -> usize {
        self.memory.allocated.load(Ordering::SeqCst)
    }

    pub fn freed(&self) -> usize {
        self.memory.freed.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.allocated() - self.freed()
    }

    /// CPU cache write-backs requested so far, across all pages.
    pub fn cache_flushes(&self) -> usize {
        self.memory.cache_flushes.load(Ordering::SeqCst)
    }

    /// Entry `index` of the live page at `bus_addr`, as the GPU would read
    /// it. `None` if no live page sits at that address.
    pub fn read_memory(&self, bus_addr: u64, index: usize) -> Option<u64> {
        self.memory
            .pages
            .lock()
            .get(&bus_addr)
            .and_then(|page| page.get(index).copied())
    }
}

impl PageAllocator for FakePageAllocator {
    fn alloc_page(&self) -> Option<Box<dyn TablePage>> {
        if let Some(limit) = *self.limit.lock() {
            if self.live() >= limit {
                return None;
            }
        }
        let bus_addr = {
            let mut next = self.next.lock();
            let page = *next;
            *next += PAGE_SIZE;
            page
        };
        self.memory
            .pages
            .lock()
            .insert(bus_addr, Box::new([0; ENTRIES_PER_PAGE]));
        self.memory.allocated.fetch_add(1, Ordering::SeqCst); // [M23]
        Some(Box::new(FakeTablePage {
            bus_addr,
            memory: Arc::clone(&self.memory),
        }))
    }
}

/// Live pin count shared by a [`FakeBusMapper`] and the mappings it hands out.
#[derive(Default)]
struct PinLedger {
    pinned_pages: AtomicU64,
}

impl BusUnpin for PinLedger {
    fn unpin_page_range(&self, _buffer_id: u64, _page_offset: u64, page_count: u64) {
        self.pinned_pages.fetch_sub(page_count, Ordering::SeqCst);
    }
}

/// Deterministic bus mapper: page `p` of buffer `b` lives at
/// `0x1_0000_0000 + b * 0x1000_0000 + p * PAGE_SIZE`.
#[derive(Default)]
pub struct FakeBusMapper {
    maps: AtomicUsize,
    fail_after: Mutex<Option<usize>>,
    ledger: Arc<PinLedger>,
}

impl FakeBusMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bus_address(buffer_id: u64, page: u64) -> u64 {
        0x1_0000_0000 + buffer_id * 0x1000_0000 + page * PAGE_SIZE
    }

    /// Make every map after the first `count` fail.
    pub fn fail_after(&self, count: Option<usize>) {
        *self.fail_after.lock() = count;
    }

    pub fn map_count(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    /// Pages currently pinned by mappings still alive.
    pub fn pinned_pages(&self) -> u64 {
        self.ledger.pinned_pages.load(Ordering::SeqCst)
    }
}

impl BusMapper for FakeBusMapper {
    fn map_page_range_bus(
        &self,
        buffer_id: u64,
        page_offset: u64,
        page_count: u64,
    ) -> Result<BusMapping, HalError> {
        if let Some(limit) = *self.fail_after.lock() {
            if self.map_count() >= limit {
                return Err(HalError::BusMapFailed);
            }
        }
        self.maps.fetch_add(1, Ordering::SeqCst);
        self.ledger
            .pinned_pages
            .fetch_add(page_count, Ordering::SeqCst);
        let addresses = (page_offset..page_offset + page_count)
            .map(|page| Self::bus_address(buffer_id, page))
            .collect();
        Ok(BusMapping::pinned(
            buffer_id,
            page_offset,
            addresses,
            self.ledger.clone(),
        ))
    }
}

// ============================================================================
// Interrupts
// ============================================================================

#[derive(Default)]
struct InterruptState {
    pending: usize,
    canceled: bool,
}

/// Interrupt line triggered by the test.
#[derive(Default)]
pub struct FakeInterrupt {
    state: Mutex<InterruptState>,
    cond: Condvar,
}

impl FakeInterrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.state.lock().pending += 1;
        self.cond.notify_one();
    }
}

impl InterruptSource for FakeInterrupt {
    fn wait(&self) -> Result<(), HalError> {
        let mut state = self.state.lock();
        loop {
            if state.canceled {
                return Err(HalError::InterruptCanceled);
            }
            if state.pending > 0 {
                state.pending -= 1;
                return Ok(());
            }
            self.cond.wait(&mut state);
        }
    }

    fn cancel(&self) {
        self.state.lock().canceled = true;
        self.cond.notify_all();
    }
}
