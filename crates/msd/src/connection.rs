//! Per-client driver state.
//!
//! TEAM_524: A connection owns one GPU address space and everything placed in
//! it: buffer mappings, the committed page sets behind them, and the JIT
//! window. It also validates atom submissions against a 256-entry ring of
//! outstanding atoms and routes completion notifications back to the client.
//!
//! All address-space state sits behind `address_lock`. Page-table updates
//! call into the address manager (through the observer) with that lock
//! held, so the manager never calls back into a connection while holding
//! its own locks.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, info, trace, warn};
use mali_error::define_kernel_error;
use mali_hal::{BusMapper, PAGE_SHIFT, PAGE_SIZE};
use mali_utils::{Region, RingBuffer};
use parking_lot::Mutex;

use crate::address_space::{
    AccessFlags, AddressSpace, AddressSpaceId, AddressSpaceOwner, MmuError, PageTableEntry,
};
use crate::atom::{
    Atom, AtomFlags, AtomInfo, AtomKind, Dependency, DependencyKind, ResultCode, SoftOp,
};
use crate::buffer::Buffer;
use crate::gpu_mapping::{GpuMapping, MappingError};
use crate::jit::{JitAllocation, JitAllocationInfo, JitError, JitMemory};
use crate::semaphore::Semaphore;

define_kernel_error! {
    /// TEAM_524: Atom submission protocol violations.
    pub enum AtomError(0x04, "atom") {
        /// Unknown bits, or more than one soft operation
        InvalidFlags = 0x01 => "Invalid atom flags",
        /// Job slot beyond what the GPU has
        InvalidSlot = 0x02 => "Invalid job slot",
        /// Dependency on itself or on a number never submitted
        InvalidDependency = 0x03 => "Invalid atom dependency",
        /// Atom number reused before the previous atom completed
        AtomStillOutstanding = 0x04 => "Atom number still outstanding",
        /// Semaphore soft atom without a semaphore
        MissingSemaphore = 0x05 => "Missing semaphore",
        /// JIT atom without allocation or free entries
        InvalidJitRequest = 0x06 => "Invalid JIT request",
        /// The connection faulted and accepts no more work
        ContextLost = 0x07 => "Context lost",
        /// More than two dependencies
        TooManyDependencies = 0x08 => "Too many dependencies",
    }
}

/// Atom numbers wrap at this many entries.
pub const ATOM_RING_SIZE: usize = 256;
/// Removed mappings remembered for fault diagnosis.
pub const RECENT_MAPPING_HISTORY: usize = 32;
/// Dependencies an atom may name.
pub const MAX_DEPENDENCIES: usize = 2;

// ============================================================================
// Owner and notifications
// ============================================================================

/// Services a connection needs from the device.
pub trait ConnectionOwner: AddressSpaceOwner + Send + Sync {
    fn bus_mapper(&self) -> Arc<dyn BusMapper>;
    fn job_slot_count(&self) -> u32;
    /// Hand a validated atom to the scheduler.
    fn schedule_atom(&self, atom: Arc<Atom>);
    /// Remove every queued atom of `connection` and stop its running ones.
    fn cancel_atoms(&self, connection: &Arc<Connection>);
}

/// Event delivered to the client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    AtomCompleted {
        atom_number: u8,
        result: ResultCode,
        user_data: u64,
    },
    PerformanceCounterReadCompleted {
        trigger_id: u64,
        result: u32,
    },
    /// The GPU faulted on this connection's address space.
    ContextLost,
}

/// Client callback. It runs with the connection's notification lock held
/// and must not install a new handler from inside `notify`.
pub trait NotificationHandler: Send + Sync {
    fn notify(&self, notification: Notification);
}

impl<F: Fn(Notification) + Send + Sync> NotificationHandler for F {
    fn notify(&self, notification: Notification) {
        self(notification);
    }
}

/// One atom as submitted by the client.
#[derive(Clone, Debug, Default)]
pub struct AtomSubmission {
    pub info: AtomInfo,
    pub dependencies: Vec<(u8, DependencyKind)>,
    pub jit_allocations: Vec<JitAllocationInfo>,
    pub jit_free_ids: Vec<u8>,
}

/// A mapping the client removed recently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemovedMapping {
    pub gpu_va: u64,
    pub size: u64,
    pub buffer_id: u64,
}

// ============================================================================
// Connection
// ============================================================================

struct AddressState {
    address_space: AddressSpace,
    /// Keyed by GPU address; ranges never overlap.
    gpu_mappings: BTreeMap<u64, GpuMapping>,
    recently_removed: RingBuffer<RemovedMapping, RECENT_MAPPING_HISTORY>,
    jit: JitMemory,
}

pub struct Connection {
    client_id: u64,
    owner: Arc<dyn ConnectionOwner>,
    address_space_id: AddressSpaceId,
    translation_table_entry: u64,
    address_lock: Mutex<AddressState>,
    outstanding_atoms: Mutex<Vec<Option<Arc<Atom>>>>,
    notification_handler: Mutex<Option<Arc<dyn NotificationHandler>>>,
    context_lost: AtomicBool,
    weak_self: Weak<Connection>,
}

impl Connection {
    pub fn create(
        client_id: u64,
        owner: Arc<dyn ConnectionOwner>,
        cache_coherent: bool,
    ) -> Result<Arc<Self>, MmuError> {
        let address_space = AddressSpace::create(&*owner, cache_coherent)?;
        debug!("connection: client {client_id} using {:?}", address_space.id());
        Ok(Arc::new_cyclic(|weak_self| Self {
            client_id,
            address_space_id: address_space.id(),
            translation_table_entry: address_space.translation_table_entry(),
            owner,
            address_lock: Mutex::new(AddressState {
                address_space,
                gpu_mappings: BTreeMap::new(),
                recently_removed: RingBuffer::new(RemovedMapping {
                    gpu_va: 0,
                    size: 0,
                    buffer_id: 0,
                }),
                jit: JitMemory::new(),
            }),
            outstanding_atoms: Mutex::new(vec![None; ATOM_RING_SIZE]),
            notification_handler: Mutex::new(None),
            context_lost: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn address_space_id(&self) -> AddressSpaceId {
        self.address_space_id
    }

    /// `AS_TRANSTAB` value for this connection's page tables.
    pub fn translation_table_entry(&self) -> u64 {
        self.translation_table_entry
    }

    // ------------------------------------------------------------------------
    // Atom submission
    // ------------------------------------------------------------------------

    /// Validate one submitted atom and pass it to the scheduler. Semaphore
    /// soft atoms consume the next entry of `semaphores`.
    pub fn execute_atom(
        &self,
        submission: &AtomSubmission,
        semaphores: &mut VecDeque<Arc<Semaphore>>,
    ) -> Result<(), AtomError> {
        let result = self.validate_and_queue(submission, semaphores);
        if let Err(e) = result {
            warn!(
                "connection: client {} rejected atom {}: {e}",
                self.client_id, submission.info.atom_number
            );
        }
        result
    }

    fn validate_and_queue(
        &self,
        submission: &AtomSubmission,
        semaphores: &mut VecDeque<Arc<Semaphore>>,
    ) -> Result<(), AtomError> {
        if self.is_context_lost() {
            return Err(AtomError::ContextLost);
        }
        let info = submission.info;
        let soft = info.flags & AtomFlags::SOFT_OPERATIONS;
        if soft.bits().count_ones() > 1
            || (!soft.is_empty() && info.flags.contains(AtomFlags::PROTECTED))
        {
            return Err(AtomError::InvalidFlags);
        }
        if soft.is_empty() && info.slot >= self.owner.job_slot_count() {
            return Err(AtomError::InvalidSlot);
        }
        if submission.dependencies.len() > MAX_DEPENDENCIES {
            return Err(AtomError::TooManyDependencies);
        }

        let mut outstanding = self.outstanding_atoms.lock();
        let number = usize::from(info.atom_number);
        if outstanding[number]
            .as_ref()
            .is_some_and(|previous| !previous.is_completed())
        {
            return Err(AtomError::AtomStillOutstanding);
        }

        let mut dependencies = Vec::with_capacity(submission.dependencies.len());
        for &(dependency, kind) in &submission.dependencies {
            if dependency == info.atom_number {
                return Err(AtomError::InvalidDependency);
            }
            let predecessor = outstanding[usize::from(dependency)]
                .clone()
                .ok_or(AtomError::InvalidDependency)?;
            dependencies.push(Dependency::new(kind, predecessor));
        }

        let kind = Self::atom_kind(soft, submission, semaphores)?;
        let atom = Atom::new(self.weak_self.clone(), self.client_id, info, kind);
        atom.set_dependencies(dependencies);
        outstanding[number] = Some(atom.clone());
        drop(outstanding);

        trace!(
            "connection: client {} queued atom {} as {}",
            self.client_id,
            info.atom_number,
            atom.trace_id()
        );
        self.owner.schedule_atom(atom);
        Ok(())
    }

    fn atom_kind(
        soft: AtomFlags,
        submission: &AtomSubmission,
        semaphores: &mut VecDeque<Arc<Semaphore>>,
    ) -> Result<AtomKind, AtomError> {
        if soft.is_empty() {
            return Ok(AtomKind::Hardware);
        }
        if soft.intersects(AtomFlags::SEMAPHORE_OPERATIONS) {
            let semaphore = semaphores.pop_front().ok_or(AtomError::MissingSemaphore)?;
            let op = if soft == AtomFlags::SEMAPHORE_SET {
                SoftOp::SemaphoreSet(semaphore)
            } else if soft == AtomFlags::SEMAPHORE_RESET {
                SoftOp::SemaphoreReset(semaphore)
            } else if soft == AtomFlags::SEMAPHORE_WAIT {
                SoftOp::SemaphoreWait(semaphore)
            } else {
                SoftOp::SemaphoreWaitAndReset(semaphore)
            };
            return Ok(AtomKind::Soft(op));
        }
        if soft == AtomFlags::JIT_ALLOCATE {
            if submission.jit_allocations.is_empty() {
                return Err(AtomError::InvalidJitRequest);
            }
            return Ok(AtomKind::Soft(SoftOp::JitAllocate(
                submission.jit_allocations.clone(),
            )));
        }
        if submission.jit_free_ids.is_empty() {
            return Err(AtomError::InvalidJitRequest);
        }
        Ok(AtomKind::Soft(SoftOp::JitFree(submission.jit_free_ids.clone())))
    }

    /// Atom last submitted under `number`.
    pub fn outstanding_atom(&self, number: u8) -> Option<Arc<Atom>> {
        self.outstanding_atoms.lock()[usize::from(number)].clone()
    }

    // ------------------------------------------------------------------------
    // Mappings
    // ------------------------------------------------------------------------

    /// Place a mapping in the address space. Nothing is committed yet.
    pub fn add_mapping(&self, mapping: GpuMapping) -> Result<(), MappingError> {
        let mut state = self.address_lock.lock();
        let region = mapping.gpu_region();
        if state
            .jit
            .region()
            .is_some_and(|jit| jit.window().overlaps(&region))
        {
            return Err(MappingError::Overlap);
        }
        Self::insert_mapping_locked(&mut state.gpu_mappings, mapping)
    }

    fn insert_mapping_locked(
        mappings: &mut BTreeMap<u64, GpuMapping>,
        mapping: GpuMapping,
    ) -> Result<(), MappingError> {
        let region = mapping.gpu_region();
        // Only the closest mapping below the end can overlap.
        if let Some((_, below)) = mappings.range(..region.end()).next_back() {
            if below.gpu_region().overlaps(&region) {
                return Err(MappingError::Overlap);
            }
        }
        mappings.insert(mapping.gpu_va(), mapping);
        Ok(())
    }

    /// Unmap everything at `gpu_va` and forget the mapping.
    pub fn remove_mapping(&self, gpu_va: u64) -> Result<(), MappingError> {
        let mut guard = self.address_lock.lock();
        let state = &mut *guard;
        let mut mapping = state
            .gpu_mappings
            .remove(&gpu_va)
            .ok_or(MappingError::NotFound)?;
        let window = mapping.page_window();
        decommit_pages(&mut state.address_space, &mut mapping, &window)?;
        state.recently_removed.push_overwrite(RemovedMapping {
            gpu_va,
            size: mapping.size(),
            buffer_id: mapping.buffer_id(),
        });
        Ok(())
    }

    /// Back `page_count` pages of `buffer` starting at `page_offset` in every
    /// mapping of that buffer. Pages already committed are left alone.
    pub fn commit_memory_for_buffer(
        &self,
        buffer: &Buffer,
        page_offset: u64,
        page_count: u64,
    ) -> Result<(), MappingError> {
        let target = buffer_range(buffer, page_offset, page_count)?;
        let bus_mapper = self.owner.bus_mapper();
        let mut guard = self.address_lock.lock();
        let state = &mut *guard;
        for mapping in state
            .gpu_mappings
            .values_mut()
            .filter(|m| m.buffer_id() == buffer.id())
        {
            commit_pages(&mut state.address_space, &*bus_mapper, mapping, &target)?;
        }
        Ok(())
    }

    /// Release exactly the committed pages inside the range.
    pub fn decommit_memory_for_buffer(
        &self,
        buffer: &Buffer,
        page_offset: u64,
        page_count: u64,
    ) -> Result<(), MappingError> {
        let target = buffer_range(buffer, page_offset, page_count)?;
        let mut guard = self.address_lock.lock();
        let state = &mut *guard;
        for mapping in state
            .gpu_mappings
            .values_mut()
            .filter(|m| m.buffer_id() == buffer.id())
        {
            decommit_pages(&mut state.address_space, mapping, &target)?;
        }
        Ok(())
    }

    /// Make the range the whole committed set: commit what is missing inside
    /// it and release everything outside it.
    pub fn set_committed_pages_for_buffer(
        &self,
        buffer: &Buffer,
        page_offset: u64,
        page_count: u64,
    ) -> Result<(), MappingError> {
        let target = buffer_range(buffer, page_offset, page_count)?;
        let bus_mapper = self.owner.bus_mapper();
        let mut guard = self.address_lock.lock();
        let state = &mut *guard;
        for mapping in state
            .gpu_mappings
            .values_mut()
            .filter(|m| m.buffer_id() == buffer.id())
        {
            for outside in mapping.page_window().subtract_with_split(&target) {
                decommit_pages(&mut state.address_space, mapping, &outside)?;
            }
            commit_pages(&mut state.address_space, &*bus_mapper, mapping, &target)?;
        }
        Ok(())
    }

    /// Committed buffer pages of the mapping at `gpu_va`.
    pub fn committed_regions(&self, gpu_va: u64) -> Option<Vec<Region>> {
        self.address_lock
            .lock()
            .gpu_mappings
            .get(&gpu_va)
            .map(GpuMapping::committed_regions)
    }

    pub fn mapping_count(&self) -> usize {
        self.address_lock.lock().gpu_mappings.len()
    }

    /// Oldest first.
    pub fn recently_removed_mappings(&self) -> Vec<RemovedMapping> {
        self.address_lock.lock().recently_removed.iter().collect()
    }

    pub fn read_pte_for_testing(&self, gpu_va: u64) -> PageTableEntry {
        self.address_lock
            .lock()
            .address_space
            .read_pte_for_testing(gpu_va)
    }

    // ------------------------------------------------------------------------
    // JIT memory
    // ------------------------------------------------------------------------

    pub fn set_jit_memory_region(
        &self,
        gpu_va: u64,
        page_count: u64,
        max_allocations: u8,
        trim_level: u8,
    ) -> Result<(), JitError> {
        let mut state = self.address_lock.lock();
        let window = Region::from_start_and_length(gpu_va, page_count.saturating_mul(PAGE_SIZE));
        if state
            .gpu_mappings
            .values()
            .any(|m| m.gpu_region().overlaps(&window))
        {
            return Err(JitError::InvalidRegion);
        }
        state
            .jit
            .initialize(gpu_va, page_count, max_allocations, trim_level)
    }

    /// Run a JIT_ALLOCATE atom. `None` means the request is valid but has to
    /// wait for a JIT_FREE.
    pub fn process_jit_allocate(&self, atom: &Atom) -> Option<ResultCode> {
        let Some(SoftOp::JitAllocate(requests)) = atom.soft_op() else {
            return Some(ResultCode::MemoryGrowthFailed);
        };
        let bus_mapper = self.owner.bus_mapper();
        let mut guard = self.address_lock.lock();
        let state = &mut *guard;

        for (index, request) in requests.iter().enumerate() {
            if requests[..index].iter().any(|r| r.id == request.id) {
                warn!("jit: client {} repeats id {}", self.client_id, request.id);
                return Some(ResultCode::MemoryGrowthFailed);
            }
            match state.jit.admit(request) {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    warn!("jit: client {} id {}: {e}", self.client_id, request.id);
                    return Some(ResultCode::MemoryGrowthFailed);
                }
            }
        }

        let mut addresses = Vec::with_capacity(requests.len());
        for request in requests {
            let outcome = allocate_jit_locked(state, &*bus_mapper, request);
            let failure = match outcome {
                Ok(Some(gpu_va)) => {
                    addresses.push(gpu_va);
                    continue;
                }
                Ok(None) => None,
                Err(e) => {
                    warn!("jit: client {} id {}: {e}", self.client_id, request.id);
                    Some(ResultCode::MemoryGrowthFailed)
                }
            };
            // All or nothing: return what this atom already took.
            for done in &requests[..addresses.len()] {
                if let Err(e) = release_jit_locked(state, done.id) {
                    error!("jit: rollback of id {} failed: {e}", done.id);
                }
            }
            return failure;
        }

        debug!(
            "jit: client {} allocated {:x?} for atom {}",
            self.client_id,
            addresses,
            atom.trace_id()
        );
        atom.set_jit_addresses(addresses);
        Some(ResultCode::Success)
    }

    /// Run a JIT_FREE atom. Freed allocations go to the reuse pool.
    pub fn process_jit_free(&self, atom: &Atom) -> ResultCode {
        let Some(SoftOp::JitFree(ids)) = atom.soft_op() else {
            return ResultCode::Success;
        };
        let mut guard = self.address_lock.lock();
        for &id in ids {
            if let Err(e) = release_jit_locked(&mut guard, id) {
                warn!("jit: client {} free of id {id}: {e}", self.client_id);
            }
        }
        ResultCode::Success
    }

    /// Give pooled JIT memory back. Returns the bytes released.
    pub fn periodic_memory_pressure_callback(&self) -> u64 {
        let released = release_pool_locked(&mut self.address_lock.lock());
        if released > 0 {
            info!(
                "connection: client {} released {released} bytes of pooled JIT memory",
                self.client_id
            );
        }
        released
    }

    pub fn jit_active_count(&self) -> usize {
        self.address_lock.lock().jit.active_count()
    }

    pub fn jit_pool_len(&self) -> usize {
        self.address_lock.lock().jit.pool_len()
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    /// Install or clear the client callback. Once this returns, the
    /// previous handler is not called again.
    pub fn set_notification_handler(&self, handler: Option<Arc<dyn NotificationHandler>>) {
        *self.notification_handler.lock() = handler;
    }

    pub fn send_notification(&self, notification: Notification) {
        let handler = self.notification_handler.lock();
        match handler.as_ref() {
            Some(handler) => handler.notify(notification),
            None => trace!(
                "connection: client {} dropped {notification:?}",
                self.client_id
            ),
        }
    }

    pub fn send_atom_completion(&self, atom: &Atom, result: ResultCode) {
        self.send_notification(Notification::AtomCompleted {
            atom_number: atom.atom_number(),
            result,
            user_data: atom.user_data(),
        });
    }

    // ------------------------------------------------------------------------
    // Faults
    // ------------------------------------------------------------------------

    /// Refuse further submissions after an MMU fault.
    pub fn mark_context_lost(&self) {
        if !self.context_lost.swap(true, Ordering::AcqRel) {
            warn!("connection: client {} lost its context", self.client_id);
            self.send_notification(Notification::ContextLost);
        }
    }

    pub fn is_context_lost(&self) -> bool {
        self.context_lost.load(Ordering::Acquire)
    }

    /// Describe the mappings near `gpu_va` for a fault report.
    pub fn describe_fault_address(&self, gpu_va: u64) -> String {
        let state = self.address_lock.lock();
        if let Some((_, mapping)) = state.gpu_mappings.range(..=gpu_va).next_back() {
            if mapping.gpu_region().contains(&Region::from_start_and_length(gpu_va, 1)) {
                return format!(
                    "{gpu_va:#x} inside buffer {} mapping at {:#x}, committed {:?}",
                    mapping.buffer_id(),
                    mapping.gpu_va(),
                    mapping.committed_regions()
                );
            }
        }
        let removed = state
            .recently_removed
            .iter()
            .filter(|r| Region::from_start_and_length(r.gpu_va, r.size).contains(
                &Region::from_start_and_length(gpu_va, 1),
            ))
            .last();
        match removed {
            Some(r) => format!(
                "{gpu_va:#x} inside recently removed mapping of buffer {} at {:#x}",
                r.buffer_id, r.gpu_va
            ),
            None => format!("{gpu_va:#x} not mapped"),
        }
    }

    pub fn dump(&self) -> Vec<String> {
        let state = self.address_lock.lock();
        let mut lines = vec![format!(
            "client {}: {:?} tte {:#x} lost {}",
            self.client_id,
            self.address_space_id,
            self.translation_table_entry,
            self.is_context_lost()
        )];
        for mapping in state.gpu_mappings.values() {
            lines.push(format!(
                "  {:#x}+{:#x} buffer {} committed {:?}",
                mapping.gpu_va(),
                mapping.size(),
                mapping.buffer_id(),
                mapping.committed_regions()
            ));
        }
        lines
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("connection: client {} closed", self.client_id);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("address_space", &self.address_space_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Page commit helpers (address lock held)
// ============================================================================

fn buffer_range(buffer: &Buffer, page_offset: u64, page_count: u64) -> Result<Region, MappingError> {
    match page_offset.checked_add(page_count) {
        Some(end) if end <= buffer.page_count() => {
            Ok(Region::from_start_and_end(page_offset, end))
        }
        _ => Err(MappingError::InvalidRange),
    }
}

/// Pin and map every uncommitted page of `target` inside the mapping.
fn commit_pages(
    space: &mut AddressSpace,
    bus_mapper: &dyn BusMapper,
    mapping: &mut GpuMapping,
    target: &Region,
) -> Result<(), MappingError> {
    for gap in mapping.uncommitted_within(target) {
        let bus = bus_mapper.map_page_range_bus(mapping.buffer_id(), gap.start(), gap.length())?;
        let gpu_va = mapping.gpu_va_of_page(gap.start());
        let length = gap.length() << PAGE_SHIFT;
        if let Err(e) = space.insert(gpu_va, &bus, gap.start() << PAGE_SHIFT, length, mapping.access())
        {
            // Pages of this gap that made it in would point at unpinned memory.
            if let Err(clear) = space.clear(gpu_va, length) {
                error!("connection: rollback of {gpu_va:#x} failed: {clear}");
            }
            return Err(e.into());
        }
        mapping.add_bus_mapping(bus)?;
    }
    Ok(())
}

/// Unmap committed pages of `target`, then unpin them.
fn decommit_pages(
    space: &mut AddressSpace,
    mapping: &mut GpuMapping,
    target: &Region,
) -> Result<(), MappingError> {
    if target.is_empty() {
        return Ok(());
    }
    let (removed, released) = mapping.remove_pages(target);
    for region in &removed {
        space.clear(
            mapping.gpu_va_of_page(region.start()),
            region.length() << PAGE_SHIFT,
        )?;
    }
    // The GPU no longer translates these pages; unpin them.
    drop(released);
    Ok(())
}

fn allocate_jit_locked(
    state: &mut AddressState,
    bus_mapper: &dyn BusMapper,
    request: &JitAllocationInfo,
) -> Result<Option<u64>, JitError> {
    let committed = Region::from_start_and_length(0, request.committed_pages);

    if let Some(mut allocation) = state.jit.take_reusable(request) {
        if let Some(mapping) = state.gpu_mappings.get_mut(&allocation.gpu_va) {
            if let Err(e) = commit_pages(&mut state.address_space, bus_mapper, mapping, &committed) {
                state.jit.return_to_pool(allocation);
                return Err(e.into());
            }
        }
        // The backing keeps its original size.
        allocation.info = JitAllocationInfo {
            va_pages: allocation.info.va_pages,
            ..*request
        };
        let gpu_va = allocation.gpu_va;
        state.jit.insert_active(allocation);
        return Ok(Some(gpu_va));
    }

    let gpu_va = match state.jit.reserve(request.va_pages) {
        Some(gpu_va) => gpu_va,
        None => {
            // Pooled allocations may be fragmenting the window.
            release_pool_locked(state);
            match state.jit.reserve(request.va_pages) {
                Some(gpu_va) => gpu_va,
                None if state.jit.active_count() > 0 => return Ok(None),
                None => return Err(JitError::OutOfVirtualMemory),
            }
        }
    };

    let size = request.va_pages << PAGE_SHIFT;
    let buffer = Buffer::new(request.va_pages);
    let mut mapping = match GpuMapping::new(
        gpu_va,
        0,
        size,
        AccessFlags::READ | AccessFlags::WRITE,
        &buffer,
    ) {
        Ok(mapping) => mapping,
        Err(e) => {
            state.jit.unreserve(gpu_va, size);
            return Err(e.into());
        }
    };
    if let Err(e) = commit_pages(&mut state.address_space, bus_mapper, &mut mapping, &committed) {
        let window = mapping.page_window();
        if let Err(clear) = decommit_pages(&mut state.address_space, &mut mapping, &window) {
            error!("jit: rollback of {gpu_va:#x} failed: {clear}");
        }
        state.jit.unreserve(gpu_va, size);
        return Err(e.into());
    }

    Connection::insert_mapping_locked(&mut state.gpu_mappings, mapping)?;
    state.jit.insert_active(JitAllocation {
        info: *request,
        gpu_va,
        buffer,
    });
    Ok(Some(gpu_va))
}

/// Move an active allocation to the pool, trimming its backing.
fn release_jit_locked(state: &mut AddressState, id: u8) -> Result<(), JitError> {
    let allocation = state.jit.remove_active(id)?;
    if let Some(mapping) = state.gpu_mappings.get_mut(&allocation.gpu_va) {
        let keep = state.jit.trimmed_page_count(mapping.committed_page_count());
        let trimmed = Region::from_start_and_end(keep, allocation.info.va_pages);
        decommit_pages(&mut state.address_space, mapping, &trimmed)?;
    }
    state.jit.return_to_pool(allocation);
    Ok(())
}

/// Unmap and unreserve every pooled allocation. Returns bytes released.
fn release_pool_locked(state: &mut AddressState) -> u64 {
    let mut released = 0;
    for allocation in state.jit.drain_pool() {
        if let Some(mut mapping) = state.gpu_mappings.remove(&allocation.gpu_va) {
            released += mapping.committed_page_count() * PAGE_SIZE;
            let window = mapping.page_window();
            if let Err(e) = decommit_pages(&mut state.address_space, &mut mapping, &window) {
                error!("jit: unmapping pooled {:#x} failed: {e}", allocation.gpu_va);
            }
        }
        state.jit.unreserve(allocation.gpu_va, allocation.size());
    }
    released
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestOwner;
    use mali_hal::fake::FakeBusMapper;

    fn hardware_atom(number: u8) -> AtomSubmission {
        AtomSubmission {
            info: AtomInfo {
                atom_number: number,
                gpu_address: 0x1000,
                ..AtomInfo::default()
            },
            ..AtomSubmission::default()
        }
    }

    fn no_semaphores() -> VecDeque<Arc<Semaphore>> {
        VecDeque::new()
    }

    #[test]
    fn test_commit_maps_requested_pages() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        let buffer = Buffer::new(8);
        let gpu_va = 0x100_0000;
        connection
            .add_mapping(
                GpuMapping::new(gpu_va, 0, 8 * PAGE_SIZE, AccessFlags::READ, &buffer).unwrap(),
            )
            .unwrap();

        connection.commit_memory_for_buffer(&buffer, 2, 3).unwrap();

        assert_eq!(
            connection.committed_regions(gpu_va),
            Some(vec![Region::from_start_and_end(2, 5)])
        );
        let pte = connection.read_pte_for_testing(gpu_va + 2 * PAGE_SIZE);
        assert_eq!(pte.address(), FakeBusMapper::bus_address(buffer.id(), 2));
        assert!(!connection.read_pte_for_testing(gpu_va + PAGE_SIZE).is_valid());
        assert!(!connection.read_pte_for_testing(gpu_va + 5 * PAGE_SIZE).is_valid());

        // Committing an overlapping range pins only the delta.
        let maps = owner.bus_mapper.map_count();
        connection.commit_memory_for_buffer(&buffer, 0, 5).unwrap();
        assert_eq!(owner.bus_mapper.map_count(), maps + 1);
        assert_eq!(
            connection.committed_regions(gpu_va),
            Some(vec![Region::from_start_and_end(0, 5)])
        );
    }

    #[test]
    fn test_decommit_releases_exact_pages() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        let buffer = Buffer::new(8);
        connection
            .add_mapping(GpuMapping::new(0, 0, 8 * PAGE_SIZE, AccessFlags::READ, &buffer).unwrap())
            .unwrap();
        connection.commit_memory_for_buffer(&buffer, 0, 8).unwrap();

        assert_eq!(owner.bus_mapper.pinned_pages(), 8);

        connection.decommit_memory_for_buffer(&buffer, 3, 2).unwrap();

        assert_eq!(owner.bus_mapper.pinned_pages(), 6);
        assert_eq!(
            connection.committed_regions(0),
            Some(vec![
                Region::from_start_and_end(0, 3),
                Region::from_start_and_end(5, 8)
            ])
        );
        assert!(!connection.read_pte_for_testing(3 * PAGE_SIZE).is_valid());
        assert!(connection.read_pte_for_testing(5 * PAGE_SIZE).is_valid());
    }

    #[test]
    fn test_set_committed_pages_replaces_set() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        let buffer = Buffer::new(8);
        connection
            .add_mapping(GpuMapping::new(0, 0, 8 * PAGE_SIZE, AccessFlags::READ, &buffer).unwrap())
            .unwrap();
        connection.commit_memory_for_buffer(&buffer, 0, 4).unwrap();

        connection.set_committed_pages_for_buffer(&buffer, 2, 4).unwrap();

        assert_eq!(
            connection.committed_regions(0),
            Some(vec![Region::from_start_and_end(2, 6)])
        );
    }

    #[test]
    fn test_commit_range_checked_against_buffer() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        let buffer = Buffer::new(4);
        assert_eq!(
            connection.commit_memory_for_buffer(&buffer, 2, 4),
            Err(MappingError::InvalidRange)
        );
    }

    #[test]
    fn test_overlapping_mappings_rejected() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        let buffer = Buffer::new(8);
        let map = |va, pages| GpuMapping::new(va, 0, pages * PAGE_SIZE, AccessFlags::READ, &buffer);

        connection.add_mapping(map(0x10_0000, 4).unwrap()).unwrap();
        assert_eq!(
            connection.add_mapping(map(0x10_3000, 2).unwrap()),
            Err(MappingError::Overlap)
        );
        assert_eq!(
            connection.add_mapping(map(0x0F_F000, 2).unwrap()),
            Err(MappingError::Overlap)
        );
        connection.add_mapping(map(0x10_4000, 2).unwrap()).unwrap();
        assert_eq!(connection.mapping_count(), 2);
    }

    #[test]
    fn test_remove_mapping_records_history() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        let buffer = Buffer::new(2);
        connection
            .add_mapping(
                GpuMapping::new(0x20_0000, 0, 2 * PAGE_SIZE, AccessFlags::READ, &buffer).unwrap(),
            )
            .unwrap();
        connection.commit_memory_for_buffer(&buffer, 0, 2).unwrap();

        connection.remove_mapping(0x20_0000).unwrap();

        assert!(!connection.read_pte_for_testing(0x20_0000).is_valid());
        assert_eq!(
            connection.recently_removed_mappings(),
            vec![RemovedMapping {
                gpu_va: 0x20_0000,
                size: 2 * PAGE_SIZE,
                buffer_id: buffer.id()
            }]
        );
        assert!(connection.describe_fault_address(0x20_1000).contains("recently removed"));
        assert_eq!(
            connection.remove_mapping(0x20_0000),
            Err(MappingError::NotFound)
        );
    }

    #[test]
    fn test_execute_atom_schedules() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        connection
            .execute_atom(&hardware_atom(5), &mut no_semaphores())
            .unwrap();

        let scheduled = owner.take_scheduled();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].atom_number(), 5);
        assert_eq!(scheduled[0].client_id(), 1);
        assert!(Arc::ptr_eq(&connection.outstanding_atom(5).unwrap(), &scheduled[0]));
    }

    #[test]
    fn test_execute_atom_validation() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        let mut semaphores = no_semaphores();

        let mut bad_slot = hardware_atom(1);
        bad_slot.info.slot = 7;
        assert_eq!(
            connection.execute_atom(&bad_slot, &mut semaphores),
            Err(AtomError::InvalidSlot)
        );

        let mut two_soft_ops = hardware_atom(1);
        two_soft_ops.info.flags = AtomFlags::SEMAPHORE_SET | AtomFlags::JIT_FREE;
        assert_eq!(
            connection.execute_atom(&two_soft_ops, &mut semaphores),
            Err(AtomError::InvalidFlags)
        );

        let mut self_dependency = hardware_atom(1);
        self_dependency.dependencies = vec![(1, DependencyKind::Order)];
        assert_eq!(
            connection.execute_atom(&self_dependency, &mut semaphores),
            Err(AtomError::InvalidDependency)
        );

        let mut unknown_dependency = hardware_atom(1);
        unknown_dependency.dependencies = vec![(9, DependencyKind::Data)];
        assert_eq!(
            connection.execute_atom(&unknown_dependency, &mut semaphores),
            Err(AtomError::InvalidDependency)
        );

        let mut semaphore_set = hardware_atom(1);
        semaphore_set.info.flags = AtomFlags::SEMAPHORE_SET;
        assert_eq!(
            connection.execute_atom(&semaphore_set, &mut semaphores),
            Err(AtomError::MissingSemaphore)
        );

        assert!(owner.take_scheduled().is_empty());
    }

    #[test]
    fn test_atom_number_reuse_requires_completion() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        connection
            .execute_atom(&hardware_atom(3), &mut no_semaphores())
            .unwrap();
        assert_eq!(
            connection.execute_atom(&hardware_atom(3), &mut no_semaphores()),
            Err(AtomError::AtomStillOutstanding)
        );

        connection
            .outstanding_atom(3)
            .unwrap()
            .set_result_code(ResultCode::Success);
        connection
            .execute_atom(&hardware_atom(3), &mut no_semaphores())
            .unwrap();
    }

    #[test]
    fn test_dependencies_resolve_to_outstanding_atoms() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        connection
            .execute_atom(&hardware_atom(1), &mut no_semaphores())
            .unwrap();
        let mut dependent = hardware_atom(2);
        dependent.dependencies = vec![(1, DependencyKind::Data)];
        connection
            .execute_atom(&dependent, &mut no_semaphores())
            .unwrap();

        let scheduled = owner.take_scheduled();
        assert!(!scheduled[1].update_dependencies());
        scheduled[0].set_result_code(ResultCode::WriteFault);
        assert!(scheduled[1].update_dependencies());
        assert_eq!(scheduled[1].final_dependency_result(), ResultCode::WriteFault);
    }

    #[test]
    fn test_semaphore_atoms_consume_in_order() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        let first = Semaphore::new();
        let second = Semaphore::new();
        let mut semaphores: VecDeque<_> = [first.clone(), second.clone()].into();

        let mut set = hardware_atom(1);
        set.info.flags = AtomFlags::SEMAPHORE_SET;
        let mut wait = hardware_atom(2);
        wait.info.flags = AtomFlags::SEMAPHORE_WAIT;
        connection.execute_atom(&set, &mut semaphores).unwrap();
        connection.execute_atom(&wait, &mut semaphores).unwrap();
        assert!(semaphores.is_empty());

        let scheduled = owner.take_scheduled();
        match scheduled[0].soft_op() {
            Some(SoftOp::SemaphoreSet(s)) => assert_eq!(s.id(), first.id()),
            other => panic!("unexpected {other:?}"),
        }
        match scheduled[1].soft_op() {
            Some(SoftOp::SemaphoreWait(s)) => assert_eq!(s.id(), second.id()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_notifications_follow_handler_swaps() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            connection.set_notification_handler(Some(Arc::new(move |n: Notification| {
                seen.lock().push(n);
            })));
        }
        connection.send_notification(Notification::ContextLost);
        connection.set_notification_handler(None);
        connection.send_notification(Notification::ContextLost);

        assert_eq!(seen.lock().clone(), vec![Notification::ContextLost]);
    }

    #[test]
    fn test_context_lost_rejects_work() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        connection.mark_context_lost();
        assert_eq!(
            connection.execute_atom(&hardware_atom(1), &mut no_semaphores()),
            Err(AtomError::ContextLost)
        );
    }

    fn jit_atom(
        connection: &Arc<Connection>,
        owner: &TestOwner,
        number: u8,
        submission: AtomSubmission,
    ) -> Arc<Atom> {
        let mut submission = submission;
        submission.info.atom_number = number;
        connection
            .execute_atom(&submission, &mut no_semaphores())
            .unwrap();
        owner.take_scheduled().pop().unwrap()
    }

    fn jit_alloc(id: u8, va_pages: u64, committed_pages: u64) -> AtomSubmission {
        AtomSubmission {
            info: AtomInfo {
                flags: AtomFlags::JIT_ALLOCATE,
                ..AtomInfo::default()
            },
            jit_allocations: vec![JitAllocationInfo {
                id,
                va_pages,
                committed_pages,
                ..JitAllocationInfo::default()
            }],
            ..AtomSubmission::default()
        }
    }

    fn jit_free(ids: Vec<u8>) -> AtomSubmission {
        AtomSubmission {
            info: AtomInfo {
                flags: AtomFlags::JIT_FREE,
                ..AtomInfo::default()
            },
            jit_free_ids: ids,
            ..AtomSubmission::default()
        }
    }

    #[test]
    fn test_jit_allocate_free_and_reuse() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        connection
            .set_jit_memory_region(0x1000_0000, 64, 4, 50)
            .unwrap();

        let alloc = jit_atom(&connection, &owner, 1, jit_alloc(1, 8, 4));
        assert_eq!(connection.process_jit_allocate(&alloc), Some(ResultCode::Success));
        let gpu_va = alloc.jit_addresses()[0];
        assert_eq!(gpu_va, 0x1000_0000);
        assert!(connection.read_pte_for_testing(gpu_va + 3 * PAGE_SIZE).is_valid());
        assert!(!connection.read_pte_for_testing(gpu_va + 4 * PAGE_SIZE).is_valid());

        alloc.set_result_code(ResultCode::Success);
        let free = jit_atom(&connection, &owner, 2, jit_free(vec![1]));
        assert_eq!(connection.process_jit_free(&free), ResultCode::Success);
        assert_eq!(connection.jit_pool_len(), 1);
        // Trim level 50 keeps half the committed pages.
        assert_eq!(owner.bus_mapper.pinned_pages(), 2);
        assert_eq!(
            connection.committed_regions(gpu_va),
            Some(vec![Region::from_start_and_end(0, 2)])
        );

        // Same bin and usage: the pooled allocation comes back.
        let again = jit_atom(&connection, &owner, 3, jit_alloc(2, 8, 4));
        assert_eq!(connection.process_jit_allocate(&again), Some(ResultCode::Success));
        assert_eq!(again.jit_addresses(), vec![gpu_va]);
        assert_eq!(connection.jit_pool_len(), 0);
        assert_eq!(
            connection.committed_regions(gpu_va),
            Some(vec![Region::from_start_and_end(0, 4)])
        );
    }

    #[test]
    fn test_jit_waits_when_window_is_full() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        connection.set_jit_memory_region(0x1000_0000, 8, 0, 0).unwrap();

        let first = jit_atom(&connection, &owner, 1, jit_alloc(1, 8, 1));
        assert_eq!(connection.process_jit_allocate(&first), Some(ResultCode::Success));

        let second = jit_atom(&connection, &owner, 2, jit_alloc(2, 8, 1));
        assert_eq!(connection.process_jit_allocate(&second), None);

        let invalid = jit_atom(&connection, &owner, 3, jit_alloc(0, 1, 1));
        assert_eq!(
            connection.process_jit_allocate(&invalid),
            Some(ResultCode::MemoryGrowthFailed)
        );
    }

    #[test]
    fn test_memory_pressure_drains_pool() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        connection.set_jit_memory_region(0x1000_0000, 16, 0, 0).unwrap();
        let alloc = jit_atom(&connection, &owner, 1, jit_alloc(1, 4, 4));
        connection.process_jit_allocate(&alloc);
        let gpu_va = alloc.jit_addresses()[0];
        let free = jit_atom(&connection, &owner, 2, jit_free(vec![1]));
        connection.process_jit_free(&free);

        assert_eq!(owner.bus_mapper.pinned_pages(), 4);
        assert_eq!(connection.periodic_memory_pressure_callback(), 4 * PAGE_SIZE);
        assert_eq!(owner.bus_mapper.pinned_pages(), 0);
        assert_eq!(connection.jit_pool_len(), 0);
        assert_eq!(connection.committed_regions(gpu_va), None);
        assert!(!connection.read_pte_for_testing(gpu_va).is_valid());
        assert_eq!(connection.periodic_memory_pressure_callback(), 0);
    }

    #[test]
    fn test_unmapping_releases_pins() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        let buffer = Buffer::new(4);
        for gpu_va in [0x10_0000, 0x20_0000] {
            connection
                .add_mapping(
                    GpuMapping::new(gpu_va, 0, 4 * PAGE_SIZE, AccessFlags::READ, &buffer).unwrap(),
                )
                .unwrap();
        }
        connection.commit_memory_for_buffer(&buffer, 0, 4).unwrap();
        assert_eq!(owner.bus_mapper.pinned_pages(), 8);

        connection.remove_mapping(0x10_0000).unwrap();
        assert_eq!(owner.bus_mapper.pinned_pages(), 4);

        drop(connection);
        assert_eq!(owner.bus_mapper.pinned_pages(), 0);
    }

    #[test]
    fn test_jit_window_is_reserved() {
        let owner = TestOwner::new(2);
        let connection = owner.connection(1);
        connection.set_jit_memory_region(0x1000_0000, 16, 0, 0).unwrap();
        let buffer = Buffer::new(1);
        assert_eq!(
            connection.add_mapping(
                GpuMapping::new(0x1000_4000, 0, PAGE_SIZE, AccessFlags::READ, &buffer).unwrap()
            ),
            Err(MappingError::Overlap)
        );
    }
}
