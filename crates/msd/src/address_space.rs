//! GPU page tables for one client address space.
//!
//! TEAM_518: Four-level LPAE tables, 4KB granule, 48-bit virtual addresses.
//! Level 3 is the root, level 0 holds the leaf translation entries. Table
//! pages come from the platform [`PageAllocator`] and are returned when a
//! table becomes empty, so the tree only ever holds mapped paths.
//!
//! Entries are written straight into the table pages the GPU walks. The
//! CPU-side tree only keeps child pointers: a table entry at index `i` is
//! valid exactly when `next_levels[i]` holds a child. Without cache
//! coherency every touched page is written back before the TLB flush.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use log::{trace, warn};
use mali_error::define_kernel_error;
use mali_hal::regs::TranslationTableFlags;
use mali_hal::{BusMapping, PAGE_SHIFT, PAGE_SIZE, PageAllocator, TablePage, is_page_aligned};
use mali_utils::Region;

define_kernel_error! {
    /// TEAM_518: GPU MMU errors.
    pub enum MmuError(0x02, "mmu") {
        /// Page table allocation failed
        AllocationFailed = 0x01 => "Page table allocation failed",
        /// Address or length not page aligned
        Misaligned = 0x02 => "Address not properly aligned",
        /// Range leaves the 48-bit address space
        InvalidVirtualAddress = 0x03 => "Invalid virtual address",
        /// Requested pages not covered by the bus mapping
        OutOfRange = 0x04 => "Range outside bus mapping",
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Levels in the tree; the root is level `PAGE_TABLE_LEVELS - 1`.
pub const PAGE_TABLE_LEVELS: u32 = 4;
/// Entries per page table (512 for 4KB pages with 8-byte entries)
pub const ENTRIES_PER_TABLE: usize = 512;
/// Bits of virtual address translated by one level.
const INDEX_BITS: u32 = 9;
/// Width of the GPU virtual address space.
pub const VIRTUAL_ADDRESS_BITS: u32 = 48;
/// First address past the translatable range.
pub const VIRTUAL_ADDRESS_LIMIT: u64 = 1 << VIRTUAL_ADDRESS_BITS;
/// Bytes translated by one leaf table (2MB).
const LEAF_SPAN_SHIFT: u32 = PAGE_SHIFT + INDEX_BITS;

const ROOT_LEVEL: u32 = PAGE_TABLE_LEVELS - 1;
const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_F000;

// Entry type field, bits [1:0].
const ENTRY_TYPE_MASK: u64 = 0b11;
const ENTRY_IS_ATE: u64 = 0b01;
const ENTRY_IS_INVALID: u64 = 0b10;
const ENTRY_IS_TABLE: u64 = 0b11;

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// Access a client requests for a GPU mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct AccessFlags: u64 {
        const READ            = 1 << 0;
        const WRITE           = 1 << 1;
        const EXECUTE         = 1 << 2;
        /// Shareable with the CPU inner domain
        const INNER_SHAREABLE = 1 << 3;
        /// Coherent with the CPU (outer shareable)
        const BOTH_SHAREABLE  = 1 << 4;
    }
}

bitflags! {
    /// Attribute bits of a leaf translation entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        // MEMATTR index at bits [4:2]
        /// Normal write-back memory (MEMATTR index 0)
        const ATTR_NORMAL        = 0b000 << 2;
        /// Outer coherent memory (MEMATTR index 1)
        const ATTR_OUTER_COHERENT = 0b001 << 2;

        const READ               = 1 << 6;
        const WRITE              = 1 << 7;

        // Shareability at bits [9:8]
        const SHARE_OUTER        = 0b10 << 8;
        const SHARE_INNER        = 0b11 << 8;

        /// Access flag, must be set or the GPU faults
        const ACCESS             = 1 << 10;
        const NO_EXECUTE         = 1 << 54;
    }
}

/// Translate client access flags into leaf attribute bits.
pub fn pte_flags_for(access: AccessFlags) -> PteFlags {
    let mut flags = PteFlags::ACCESS;
    if access.contains(AccessFlags::READ) {
        flags |= PteFlags::READ;
    }
    if access.contains(AccessFlags::WRITE) {
        flags |= PteFlags::WRITE;
    }
    if !access.contains(AccessFlags::EXECUTE) {
        flags |= PteFlags::NO_EXECUTE;
    }
    if access.contains(AccessFlags::BOTH_SHAREABLE) {
        flags |= PteFlags::SHARE_OUTER | PteFlags::ATTR_OUTER_COHERENT;
    } else if access.contains(AccessFlags::INNER_SHAREABLE) {
        flags |= PteFlags::SHARE_INNER;
    }
    flags
}

// ============================================================================
// Page Table Entry
// ============================================================================

/// A 64-bit GPU page table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const INVALID: Self = Self(ENTRY_IS_INVALID);

    /// Entry pointing at a next-level table.
    pub const fn table(bus_addr: u64) -> Self {
        Self((bus_addr & ADDRESS_MASK) | ENTRY_IS_TABLE)
    }

    /// Leaf entry translating to `bus_addr`.
    pub const fn translation(bus_addr: u64, flags: PteFlags) -> Self {
        Self((bus_addr & ADDRESS_MASK) | flags.bits() | ENTRY_IS_ATE)
    }

    /// Entry as read back from a table page.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_table(self) -> bool {
        self.0 & ENTRY_TYPE_MASK == ENTRY_IS_TABLE
    }

    #[inline]
    pub const fn is_translation(self) -> bool {
        self.0 & ENTRY_TYPE_MASK == ENTRY_IS_ATE
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.is_table() || self.is_translation()
    }

    #[inline]
    pub const fn address(self) -> u64 {
        self.0 & ADDRESS_MASK
    }

    #[inline]
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_table() {
            write!(f, "Table({:#x})", self.address())
        } else if self.is_translation() {
            write!(f, "Page({:#x}, {:?})", self.address(), self.flags())
        } else {
            write!(f, "Invalid")
        }
    }
}

/// Index into the table at `level` for `va`.
#[inline]
pub const fn table_index(va: u64, level: u32) -> usize {
    ((va >> (PAGE_SHIFT + INDEX_BITS * level)) & (ENTRIES_PER_TABLE as u64 - 1)) as usize
}

// ============================================================================
// Page Table
// ============================================================================

/// One table page plus the CPU-side pointers to its children.
///
/// Entries live only in the page the GPU walks. `next_levels[i]` holds a
/// child exactly when entry `i` is a table entry pointing at that child.
struct PageTable {
    level: u32,
    page: Box<dyn TablePage>,
    cache_coherent: bool,
    valid_entries: usize,
    /// Empty at level 0.
    next_levels: Vec<Option<Box<PageTable>>>,
    allocator: Arc<dyn PageAllocator>,
}

impl PageTable {
    fn create(
        level: u32,
        cache_coherent: bool,
        allocator: &Arc<dyn PageAllocator>,
    ) -> Result<Self, MmuError> {
        let page = allocator.alloc_page().ok_or(MmuError::AllocationFailed)?; // [M23]
        for index in 0..ENTRIES_PER_TABLE {
            page.write_entry(index, PageTableEntry::INVALID.raw());
        }
        let next_levels = if level == 0 {
            Vec::new()
        } else {
            (0..ENTRIES_PER_TABLE).map(|_| None).collect()
        };
        let table = Self {
            level,
            page,
            cache_coherent,
            valid_entries: 0,
            next_levels,
            allocator: Arc::clone(allocator),
        };
        table.sync();
        Ok(table)
    }

    fn bus_addr(&self) -> u64 {
        self.page.bus_addr()
    }

    fn entry(&self, index: usize) -> PageTableEntry {
        PageTableEntry::from_raw(self.page.read_entry(index))
    }

    fn set_entry(&mut self, index: usize, entry: PageTableEntry) {
        match (self.entry(index).is_valid(), entry.is_valid()) {
            (false, true) => self.valid_entries += 1,
            (true, false) => self.valid_entries -= 1,
            _ => {}
        }
        self.page.write_entry(index, entry.raw());
    }

    /// Make entry writes visible to a GPU that does not snoop CPU caches.
    fn sync(&self) {
        if !self.cache_coherent {
            self.page.flush_cpu_cache();
        }
    }

    fn is_empty(&self) -> bool {
        self.valid_entries == 0
    }

    fn next_level(&self, index: usize) -> Option<&PageTable> {
        self.next_levels.get(index)?.as_deref()
    }

    fn next_level_mut(&mut self, index: usize) -> Option<&mut PageTable> {
        self.next_levels.get_mut(index)?.as_deref_mut()
    }

    /// Get or create the child table at `index`.
    fn next_level_or_create(&mut self, index: usize) -> Result<&mut PageTable, MmuError> {
        if self.next_level(index).is_none() {
            // The child is fully written before the GPU can reach it.
            let child = PageTable::create(self.level - 1, self.cache_coherent, &self.allocator)?;
            self.set_entry(index, PageTableEntry::table(child.bus_addr()));
            self.sync();
            self.next_levels[index] = Some(Box::new(child));
        }
        self.next_level_mut(index).ok_or(MmuError::AllocationFailed)
    }

    /// Free empty tables along the path of `va`. Returns whether `self` is
    /// now empty; the caller owns `self` and decides whether to free it.
    fn collect_empty_tables(&mut self, va: u64) -> bool {
        if self.level > 0 {
            let index = table_index(va, self.level);
            let child_empty = self
                .next_level_mut(index)
                .is_some_and(|child| child.collect_empty_tables(va));
            if child_empty {
                // Entry first, then the page behind it.
                self.set_entry(index, PageTableEntry::INVALID);
                self.sync();
                self.next_levels[index] = None; // [M24]
            }
        }
        self.is_empty()
    }
}

// ============================================================================
// Address Space
// ============================================================================

/// Process-unique identity of an address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Receives TLB maintenance requests for an address space. Implemented by
/// the address manager, which knows whether the space is resident in a
/// hardware slot.
pub trait AddressSpaceObserver: Send + Sync {
    /// Invalidate cached translations for `[start, start + length)`.
    /// `synchronous` flushes must complete before the call returns.
    fn flush_address_mapping_range(
        &self,
        space: AddressSpaceId,
        start: u64,
        length: u64,
        synchronous: bool,
    );

    /// Unlock a region the MMU locked after a fault.
    fn unlock_address_space(&self, space: AddressSpaceId);

    /// The space is being destroyed; drop any hardware slot it occupies.
    fn release_space_mappings(&self, space: AddressSpaceId);
}

/// Supplies the services an address space is built from.
pub trait AddressSpaceOwner {
    fn address_space_observer(&self) -> Arc<dyn AddressSpaceObserver>;
    fn page_allocator(&self) -> Arc<dyn PageAllocator>;
}

/// One client's GPU virtual address space.
pub struct AddressSpace {
    id: AddressSpaceId,
    cache_coherent: bool,
    root: PageTable,
    observer: Arc<dyn AddressSpaceObserver>,
}

impl AddressSpace {
    /// Create an empty space. Only the root table is allocated.
    pub fn create<O: AddressSpaceOwner + ?Sized>(
        owner: &O,
        cache_coherent: bool,
    ) -> Result<Self, MmuError> {
        let allocator = owner.page_allocator();
        let root = PageTable::create(ROOT_LEVEL, cache_coherent, &allocator)?;
        Ok(Self {
            id: AddressSpaceId::next(),
            cache_coherent,
            root,
            observer: owner.address_space_observer(),
        })
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    /// Value for the `AS_TRANSTAB` register.
    pub fn translation_table_entry(&self) -> u64 {
        let mut flags = TranslationTableFlags::ADRMODE_TABLE | TranslationTableFlags::READ_INNER;
        if self.cache_coherent {
            flags |= TranslationTableFlags::SHARE_OUTER;
        }
        self.root.bus_addr() | flags.bits()
    }

    /// Map `length` bytes at `gpu_va` to the pages of `bus_mapping` starting
    /// at byte `offset` into the buffer.
    ///
    /// If a table allocation fails part way, the pages written so far stay
    /// mapped and are flushed before the error is returned.
    pub fn insert(
        &mut self,
        gpu_va: u64,
        bus_mapping: &BusMapping,
        offset: u64,
        length: u64,
        access: AccessFlags,
    ) -> Result<(), MmuError> {
        check_va_range(gpu_va, length)?;
        if !is_page_aligned(offset) {
            return Err(MmuError::Misaligned);
        }
        let first_page = offset >> PAGE_SHIFT;
        let page_count = length >> PAGE_SHIFT;
        let requested = Region::from_start_and_length(first_page, page_count);
        if !bus_mapping.page_region().contains(&requested) {
            return Err(MmuError::OutOfRange);
        }

        let flags = pte_flags_for(access);
        let end = gpu_va + length;
        let mut va = gpu_va;
        while va < end {
            let chunk_end = leaf_span_end(va).min(end);
            let leaf = match self.leaf_table_or_create(va) {
                Ok(leaf) => leaf,
                Err(e) => {
                    let written = va - gpu_va;
                    warn!(
                        "mmu: insert at {va:#x} failed after {} pages: {e}",
                        written >> PAGE_SHIFT
                    );
                    if written > 0 {
                        self.observer
                            .flush_address_mapping_range(self.id, gpu_va, written, false);
                    }
                    return Err(e);
                }
            };
            let mut page = va;
            while page < chunk_end {
                let buffer_page = first_page + ((page - gpu_va) >> PAGE_SHIFT);
                let bus_addr = bus_mapping
                    .bus_address_of_page(buffer_page)
                    .ok_or(MmuError::OutOfRange)?;
                leaf.set_entry(
                    table_index(page, 0),
                    PageTableEntry::translation(bus_addr, flags),
                );
                page += PAGE_SIZE;
            }
            leaf.sync();
            va = chunk_end;
        }

        trace!("mmu: mapped {gpu_va:#x}+{length:#x} in {:?}", self.id);
        self.observer
            .flush_address_mapping_range(self.id, gpu_va, length, false);
        Ok(())
    }

    /// Invalidate `length` bytes at `start` and free tables left empty.
    /// The flush is synchronous: once this returns the GPU no longer
    /// translates the range and the bus pages may be released.
    pub fn clear(&mut self, start: u64, length: u64) -> Result<(), MmuError> {
        check_va_range(start, length)?;
        let end = start + length;
        let mut va = start;
        while va < end {
            let chunk_end = leaf_span_end(va).min(end);
            if let Some(leaf) = self.leaf_table_mut(va) {
                let mut page = va;
                while page < chunk_end {
                    leaf.set_entry(table_index(page, 0), PageTableEntry::INVALID);
                    page += PAGE_SIZE;
                }
                leaf.sync();
                self.root.collect_empty_tables(va);
            }
            va = chunk_end;
        }

        trace!("mmu: cleared {start:#x}+{length:#x} in {:?}", self.id);
        self.observer
            .flush_address_mapping_range(self.id, start, length, true);
        Ok(())
    }

    /// Leaf entry for `va`; invalid when no leaf table covers it.
    pub fn read_pte_for_testing(&self, va: u64) -> PageTableEntry {
        self.read_table_entry_for_testing(va, 0)
    }

    /// Entry for `va` inside the table at `level` (3 = root).
    pub fn read_table_entry_for_testing(&self, va: u64, level: u32) -> PageTableEntry {
        let mut table = &self.root;
        while table.level > level {
            match table.next_level(table_index(va, table.level)) {
                Some(next) => table = next,
                None => return PageTableEntry::INVALID,
            }
        }
        table.entry(table_index(va, table.level))
    }

    fn leaf_table_or_create(&mut self, va: u64) -> Result<&mut PageTable, MmuError> {
        let mut table = &mut self.root;
        while table.level > 0 {
            let index = table_index(va, table.level);
            table = table.next_level_or_create(index)?;
        }
        Ok(table)
    }

    fn leaf_table_mut(&mut self, va: u64) -> Option<&mut PageTable> {
        let mut table = &mut self.root;
        while table.level > 0 {
            let index = table_index(va, table.level);
            table = table.next_level_mut(index)?;
        }
        Some(table)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Evict from any hardware slot before the table pages go away.
        self.observer.release_space_mappings(self.id);
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("root", &format_args!("{:#x}", self.root.bus_addr()))
            .finish_non_exhaustive()
    }
}

/// First address past the leaf table that translates `va`.
fn leaf_span_end(va: u64) -> u64 {
    ((va >> LEAF_SPAN_SHIFT) + 1) << LEAF_SPAN_SHIFT
}

fn check_va_range(start: u64, length: u64) -> Result<(), MmuError> {
    if !is_page_aligned(start) || !is_page_aligned(length) {
        return Err(MmuError::Misaligned);
    }
    match start.checked_add(length) {
        Some(end) if end <= VIRTUAL_ADDRESS_LIMIT => Ok(()),
        _ => Err(MmuError::InvalidVirtualAddress),
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use mali_hal::fake::FakePageAllocator;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Flush {
        start: u64,
        length: u64,
        synchronous: bool,
    }

    struct RecordingObserver {
        allocator: Arc<FakePageAllocator>,
        flushes: Mutex<Vec<Flush>>,
        /// Pages freed at the moment the release callback ran.
        released: Mutex<Vec<(AddressSpaceId, usize)>>,
        /// CPU cache write-backs seen at each TLB flush.
        cache_flushes_at_flush: Mutex<Vec<usize>>,
    }

    impl AddressSpaceObserver for RecordingObserver {
        fn flush_address_mapping_range(
            &self,
            _space: AddressSpaceId,
            start: u64,
            length: u64,
            synchronous: bool,
        ) {
            self.flushes.lock().push(Flush {
                start,
                length,
                synchronous,
            });
            self.cache_flushes_at_flush
                .lock()
                .push(self.allocator.cache_flushes());
        }

        fn unlock_address_space(&self, _space: AddressSpaceId) {}

        fn release_space_mappings(&self, space: AddressSpaceId) {
            self.released.lock().push((space, self.allocator.freed()));
        }
    }

    struct TestOwner {
        allocator: Arc<FakePageAllocator>,
        observer: Arc<RecordingObserver>,
    }

    impl TestOwner {
        fn new() -> Self {
            let allocator = Arc::new(FakePageAllocator::new());
            let observer = Arc::new(RecordingObserver {
                allocator: allocator.clone(),
                flushes: Mutex::new(Vec::new()),
                released: Mutex::new(Vec::new()),
                cache_flushes_at_flush: Mutex::new(Vec::new()),
            });
            Self {
                allocator,
                observer,
            }
        }
    }

    impl AddressSpaceOwner for TestOwner {
        fn address_space_observer(&self) -> Arc<dyn AddressSpaceObserver> {
            self.observer.clone()
        }
        fn page_allocator(&self) -> Arc<dyn PageAllocator> {
            self.allocator.clone()
        }
    }

    fn mapping(pages: u64) -> BusMapping {
        BusMapping::new(0, (0..pages).map(|p| 0x8000_0000 + p * PAGE_SIZE).collect())
    }

    /// Walk the tables the way the GPU does, through raw page memory.
    fn gpu_walk(allocator: &FakePageAllocator, tte: u64, va: u64) -> Option<PageTableEntry> {
        let mut table = tte & ADDRESS_MASK;
        for level in (0..PAGE_TABLE_LEVELS).rev() {
            let entry = PageTableEntry::from_raw(allocator.read_memory(table, table_index(va, level))?);
            if level == 0 {
                return Some(entry);
            }
            if !entry.is_table() {
                return None;
            }
            table = entry.address();
        }
        None
    }

    #[test]
    fn test_table_index() {
        let va = 0x0000_1234_5678_9000u64;
        assert_eq!(table_index(va, 0), ((va >> 12) & 0x1FF) as usize);
        assert_eq!(table_index(va, 1), ((va >> 21) & 0x1FF) as usize);
        assert_eq!(table_index(va, 2), ((va >> 30) & 0x1FF) as usize);
        assert_eq!(table_index(va, 3), ((va >> 39) & 0x1FF) as usize);
    }

    #[test]
    fn test_entry_encoding() {
        assert!(!PageTableEntry::INVALID.is_valid());
        let table = PageTableEntry::table(0x4000_1000);
        assert!(table.is_table());
        assert_eq!(table.address(), 0x4000_1000);
        let page = PageTableEntry::translation(0x5000_0000, PteFlags::READ | PteFlags::ACCESS);
        assert!(page.is_translation());
        assert!(!page.is_table());
        assert!(page.flags().contains(PteFlags::READ));
    }

    #[test]
    fn test_access_flag_translation() {
        let rw = pte_flags_for(AccessFlags::READ | AccessFlags::WRITE);
        assert!(rw.contains(PteFlags::READ | PteFlags::WRITE | PteFlags::ACCESS));
        assert!(rw.contains(PteFlags::NO_EXECUTE));

        let rx = pte_flags_for(AccessFlags::READ | AccessFlags::EXECUTE);
        assert!(!rx.contains(PteFlags::NO_EXECUTE));
        assert!(!rx.contains(PteFlags::WRITE));

        let coherent = pte_flags_for(AccessFlags::READ | AccessFlags::BOTH_SHAREABLE);
        assert!(coherent.contains(PteFlags::SHARE_OUTER | PteFlags::ATTR_OUTER_COHERENT));
    }

    #[test]
    fn test_create_allocates_only_root() {
        let owner = TestOwner::new();
        let space = AddressSpace::create(&owner, false).unwrap();
        assert_eq!(owner.allocator.live(), 1);
        assert!(!space.read_pte_for_testing(0x1000).is_valid());
    }

    #[test]
    fn test_insert_then_read() {
        let owner = TestOwner::new();
        let mut space = AddressSpace::create(&owner, false).unwrap();
        let bus = mapping(4);

        space
            .insert(0x100_0000, &bus, PAGE_SIZE, 2 * PAGE_SIZE, AccessFlags::READ)
            .unwrap();

        let pte = space.read_pte_for_testing(0x100_0000);
        assert!(pte.is_translation());
        assert_eq!(pte.address(), 0x8000_0000 + PAGE_SIZE);
        assert_eq!(space.read_pte_for_testing(0x100_1000).address(), 0x8000_2000);
        assert!(!space.read_pte_for_testing(0x100_2000).is_valid());
        // Root + levels 2, 1, 0.
        assert_eq!(owner.allocator.live(), 4);

        let flushes = owner.observer.flushes.lock().clone();
        assert_eq!(
            flushes,
            vec![Flush {
                start: 0x100_0000,
                length: 2 * PAGE_SIZE,
                synchronous: false
            }]
        );
    }

    #[test]
    fn test_clear_reclaims_tables() {
        let owner = TestOwner::new();
        let mut space = AddressSpace::create(&owner, false).unwrap();
        let va = 0x1234_5000u64;
        space
            .insert(va, &mapping(1), 0, PAGE_SIZE, AccessFlags::READ)
            .unwrap();
        assert!(space.read_table_entry_for_testing(va, 3).is_table());

        space.clear(va, PAGE_SIZE).unwrap();

        assert!(!space.read_pte_for_testing(va).is_valid());
        // Levels 0, 1, 2 freed; the root is never freed.
        assert_eq!(owner.allocator.freed(), 3);
        assert_eq!(owner.allocator.live(), 1);
        assert!(!space.read_table_entry_for_testing(va, 3).is_valid());

        let last = owner.observer.flushes.lock().last().copied().unwrap();
        assert!(last.synchronous);
        assert_eq!(last.start, va);
    }

    #[test]
    fn test_entries_land_in_gpu_memory() {
        let owner = TestOwner::new();
        let mut space = AddressSpace::create(&owner, true).unwrap();
        let tte = space.translation_table_entry();
        let va = 0x7_4020_3000u64;

        assert!(gpu_walk(&owner.allocator, tte, va).is_none());

        space
            .insert(va, &mapping(2), 0, 2 * PAGE_SIZE, AccessFlags::READ | AccessFlags::WRITE)
            .unwrap();
        let pte = gpu_walk(&owner.allocator, tte, va).unwrap();
        assert!(pte.is_translation());
        assert_eq!(pte.address(), 0x8000_0000);
        assert!(pte.flags().contains(PteFlags::WRITE));
        assert_eq!(
            gpu_walk(&owner.allocator, tte, va + PAGE_SIZE).unwrap().address(),
            0x8000_1000
        );
        assert_eq!(space.read_pte_for_testing(va), pte);

        space.clear(va, PAGE_SIZE).unwrap();
        assert!(!gpu_walk(&owner.allocator, tte, va).unwrap().is_valid());

        space.clear(va + PAGE_SIZE, PAGE_SIZE).unwrap();
        // Tables on the path are gone; the root entry no longer points at them.
        assert!(gpu_walk(&owner.allocator, tte, va).is_none());
        assert_eq!(owner.allocator.live(), 1);
    }

    #[test]
    fn test_non_coherent_tables_written_back_before_tlb_flush() {
        let owner = TestOwner::new();
        let mut space = AddressSpace::create(&owner, false).unwrap();
        let created = owner.allocator.cache_flushes();
        assert!(created >= 1);

        space
            .insert(0x100_0000, &mapping(1), 0, PAGE_SIZE, AccessFlags::READ)
            .unwrap();
        let after_insert = owner.allocator.cache_flushes();
        // Three new tables plus the entries in the root, level 2 and level 1
        // and the leaf.
        assert!(after_insert > created + 3);
        assert_eq!(
            owner.observer.cache_flushes_at_flush.lock().clone(),
            vec![after_insert]
        );

        space.clear(0x100_0000, PAGE_SIZE).unwrap();
        let seen = owner.observer.cache_flushes_at_flush.lock().clone();
        assert!(seen[1] > after_insert);
        assert_eq!(seen[1], owner.allocator.cache_flushes());
    }

    #[test]
    fn test_coherent_tables_skip_cache_maintenance() {
        let owner = TestOwner::new();
        let mut space = AddressSpace::create(&owner, true).unwrap();
        space
            .insert(0x100_0000, &mapping(1), 0, PAGE_SIZE, AccessFlags::READ)
            .unwrap();
        space.clear(0x100_0000, PAGE_SIZE).unwrap();
        assert_eq!(owner.allocator.cache_flushes(), 0);
    }

    #[test]
    fn test_clear_keeps_tables_with_live_entries() {
        let owner = TestOwner::new();
        let mut space = AddressSpace::create(&owner, false).unwrap();
        space
            .insert(0x40_0000, &mapping(2), 0, 2 * PAGE_SIZE, AccessFlags::READ)
            .unwrap();

        space.clear(0x40_0000, PAGE_SIZE).unwrap();

        assert_eq!(owner.allocator.freed(), 0);
        assert!(space.read_pte_for_testing(0x40_1000).is_valid());
    }

    #[test]
    fn test_clear_unmapped_range_is_harmless() {
        let owner = TestOwner::new();
        let mut space = AddressSpace::create(&owner, false).unwrap();
        space.clear(0x1_0000_0000, 64 * 1024 * 1024).unwrap();
        assert_eq!(owner.allocator.live(), 1);
    }

    #[test]
    fn test_range_validation() {
        let owner = TestOwner::new();
        let mut space = AddressSpace::create(&owner, false).unwrap();
        let bus = mapping(2);

        assert_eq!(
            space.insert(0x1001, &bus, 0, PAGE_SIZE, AccessFlags::READ),
            Err(MmuError::Misaligned)
        );
        assert_eq!(
            space.insert(0x1000, &bus, 0, 100, AccessFlags::READ),
            Err(MmuError::Misaligned)
        );
        assert_eq!(
            space.insert(
                VIRTUAL_ADDRESS_LIMIT - PAGE_SIZE,
                &bus,
                0,
                2 * PAGE_SIZE,
                AccessFlags::READ
            ),
            Err(MmuError::InvalidVirtualAddress)
        );
        assert_eq!(
            space.insert(0x1000, &bus, PAGE_SIZE, 2 * PAGE_SIZE, AccessFlags::READ),
            Err(MmuError::OutOfRange)
        );
        assert_eq!(
            space.clear(u64::MAX & !(PAGE_SIZE - 1), PAGE_SIZE),
            Err(MmuError::InvalidVirtualAddress)
        );
        assert!(owner.observer.flushes.lock().is_empty());
    }

    #[test]
    fn test_insert_partial_failure_keeps_prefix() {
        let owner = TestOwner::new();
        let mut space = AddressSpace::create(&owner, false).unwrap();
        // Root plus one path of three tables.
        owner.allocator.set_limit(Some(4));

        // Last page of one leaf table, then the first page of the next.
        let va = 0x1F_F000u64;
        let result = space.insert(va, &mapping(2), 0, 2 * PAGE_SIZE, AccessFlags::READ);

        assert_eq!(result, Err(MmuError::AllocationFailed));
        assert!(space.read_pte_for_testing(va).is_valid());
        assert!(!space.read_pte_for_testing(va + PAGE_SIZE).is_valid());
        let flushes = owner.observer.flushes.lock().clone();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].length, PAGE_SIZE);
    }

    #[test]
    fn test_translation_table_entry() {
        let owner = TestOwner::new();
        let plain = AddressSpace::create(&owner, false).unwrap();
        let tte = plain.translation_table_entry();
        assert_eq!(tte & 0b11, TranslationTableFlags::ADRMODE_TABLE.bits());
        assert_ne!(tte & TranslationTableFlags::READ_INNER.bits(), 0);
        assert_eq!(tte & TranslationTableFlags::SHARE_OUTER.bits(), 0);

        let coherent = AddressSpace::create(&owner, true).unwrap();
        assert_ne!(
            coherent.translation_table_entry() & TranslationTableFlags::SHARE_OUTER.bits(),
            0
        );
        assert_ne!(plain.id(), coherent.id());
    }

    #[test]
    fn test_drop_releases_slot_before_freeing_tables() {
        let owner = TestOwner::new();
        let mut space = AddressSpace::create(&owner, false).unwrap();
        space
            .insert(0x2000_0000, &mapping(1), 0, PAGE_SIZE, AccessFlags::READ)
            .unwrap();
        let id = space.id();

        drop(space);

        assert_eq!(owner.observer.released.lock().clone(), vec![(id, 0)]);
        assert_eq!(owner.allocator.live(), 0);
    }
}
